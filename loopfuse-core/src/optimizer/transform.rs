//! Fusion Transform
//!
//! CFG surgery merging a legal pair of adjacent loops into one.
//!
//! # Algorithm
//! Given loop A (anchor) followed by loop B:
//! 1. Replace every use of B's induction variable with A's
//! 2. Redirect A's body edges into A's latch to B's first body block, and B's body
//!    edges into B's latch to A's latch, so one latch drives both bodies
//! 3. Redirect A's header exit to B's exit block; B's header, B's latch and the block
//!    between the loops become unreachable
//! 4. Remove unreachable blocks and repair the phis of the blocks that lost predecessors
//! 5. Verify, then move B's blocks into A in the loop forest
//!
//! The transform runs on a staged copy of the function and the forest. The caller's
//! copies are only replaced once every step succeeded, so a failed fusion leaves
//! nothing behind.

use crate::analysis::control_flow::ControlFlowAnalyzer;
use crate::analysis::loop_analysis::{Loop, LoopForest, LoopId};
use crate::error::FusionError;
use crate::ir::function::Function;
use crate::ir::instruction::{BlockId, Operand, ValueId};
use crate::optimizer::legality::{FusionCandidate, LoopShape, Verdict};
use smallvec::SmallVec;

/// What a successful fusion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionRecord {
    pub anchor: LoopId,
    pub fused: LoopId,
    /// Blocks deleted from the function, in their former layout order.
    pub removed_blocks: Vec<BlockId>,
}

/// Everything the surgery needs, read off the loop views before mutation starts.
#[derive(Debug, Clone)]
struct FusionPlan {
    a_header: BlockId,
    a_latch: BlockId,
    a_exit: BlockId,
    a_iv: ValueId,
    /// In-loop predecessors of A's latch.
    a_latch_preds: SmallVec<[BlockId; 2]>,
    b_latch: BlockId,
    b_exit: BlockId,
    b_iv: ValueId,
    b_body_entry: BlockId,
    b_latch_preds: SmallVec<[BlockId; 2]>,
    /// Last body block of B in reverse post-order, if B has a body.
    b_last_body: Option<BlockId>,
}

pub struct FusionTransformer;

impl FusionTransformer {
    /// Fuse the candidate's second loop into its first.
    ///
    /// # Errors
    /// - `FusionError::NotLegal` if the candidate's verdict is illegal
    /// - structural errors (`MissingEdge`, `PhiRepair`, `Verification`, ...) if the
    ///   surgery cannot be completed; `func` and `forest` are then unchanged
    pub fn fuse(
        func: &mut Function,
        forest: &mut LoopForest,
        candidate: &FusionCandidate,
    ) -> Result<FusionRecord, FusionError> {
        if let Verdict::Illegal(reason) = candidate.verdict {
            return Err(FusionError::NotLegal {
                first: candidate.first,
                second: candidate.second,
                reason,
            });
        }

        let mut staged_func: Function = func.clone();
        let mut staged_forest: LoopForest = forest.clone();
        let record = Self::apply(
            &mut staged_func,
            &mut staged_forest,
            candidate.first,
            candidate.second,
        )?;

        *func = staged_func;
        *forest = staged_forest;
        log::info!(
            "{}: fused {} into {}, removed {} block(s)",
            func.name,
            record.fused,
            record.anchor,
            record.removed_blocks.len()
        );
        Ok(record)
    }

    fn plan(
        func: &Function,
        forest: &LoopForest,
        first: LoopId,
        second: LoopId,
    ) -> Result<FusionPlan, FusionError> {
        let a = forest
            .get(first)
            .ok_or(FusionError::MissingLoop { loop_id: first })?;
        let b = forest
            .get(second)
            .ok_or(FusionError::MissingLoop { loop_id: second })?;
        let shape_a = LoopShape::of(func, a)
            .ok_or_else(|| FusionError::malformed(first, "not a canonical single-exit loop"))?;
        let shape_b = LoopShape::of(func, b)
            .ok_or_else(|| FusionError::malformed(second, "not a canonical single-exit loop"))?;

        let in_loop_preds = |lp: &Loop, latch: BlockId| {
            func.predecessors(latch)
                .into_iter()
                .filter(|pred| lp.contains(*pred))
                .collect::<SmallVec<[BlockId; 2]>>()
        };

        Ok(FusionPlan {
            a_header: shape_a.header,
            a_latch: shape_a.latch,
            a_exit: shape_a.exit,
            a_iv: shape_a.induction.phi,
            a_latch_preds: in_loop_preds(a, shape_a.latch),
            b_latch: shape_b.latch,
            b_exit: shape_b.exit,
            b_iv: shape_b.induction.phi,
            b_body_entry: shape_b.exit_condition.body_entry,
            b_latch_preds: in_loop_preds(b, shape_b.latch),
            b_last_body: b.body().last(),
        })
    }

    fn apply(
        func: &mut Function,
        forest: &mut LoopForest,
        first: LoopId,
        second: LoopId,
    ) -> Result<FusionRecord, FusionError> {
        let plan = Self::plan(func, forest, first, second)?;
        log::debug!("{}: fusion plan {:?}", func.name, plan);

        let rewritten = func.replace_all_uses(plan.b_iv, Operand::Value(plan.a_iv));
        log::debug!("{}: rewrote {} use(s) of {}", func.name, rewritten, plan.b_iv);

        // B without body blocks contributes nothing between header and latch.
        if plan.b_body_entry != plan.b_latch {
            for &pred in plan.a_latch_preds.iter() {
                func.retarget_edge(pred, plan.a_latch, plan.b_body_entry)?;
            }
            for &pred in plan.b_latch_preds.iter() {
                func.retarget_edge(pred, plan.b_latch, plan.a_latch)?;
            }
            if let Some(last) = plan.b_last_body {
                func.move_block_after(plan.a_latch, last)?;
            }
        }

        func.retarget_edge(plan.a_header, plan.a_exit, plan.b_exit)?;

        let removed: Vec<BlockId> = ControlFlowAnalyzer::eliminate_unreachable_blocks(func);
        let repaired = func.repair_phis()?;
        log::debug!("{}: repaired {} phi(s)", func.name, repaired);
        func.verify()?;

        forest.absorb(func, first, second, &removed)?;

        Ok(FusionRecord {
            anchor: first,
            fused: second,
            removed_blocks: removed,
        })
    }
}
