//! Loop Analysis
//!
//! Natural loop discovery and the `LoopForest` index the fusion pass reads and
//! updates.
//!
//! # Algorithm
//! 1. Compute dominators over reverse post-order
//! 2. Every edge `latch -> header` where `header` dominates `latch` is a back edge
//! 3. Back edges sharing a header form one natural loop; its body is the header plus
//!    every block that reaches a latch without passing through the header
//! 4. Loops are nested by containment of headers, innermost first per block
//! 5. Each loop's induction variable and exit condition are recognised from its header
//!
//! # Memory Optimizations
//! - Loop bodies are kept as `BitVec<u32>` masks next to their ordered block lists
//! - Latches, back edges and exits use `SmallVec` (one or two entries in practice)

use crate::analysis::control_flow::{ControlFlowAnalyzer, DominatorTree};
use crate::error::FusionError;
use crate::ir::function::Function;
use crate::ir::instruction::{BinaryOp, BlockId, InstKind, Operand, Predicate, Terminator, ValueId};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Stable loop identity. Ids are assigned in header reverse post-order and are
/// never reused within one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub u32);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop{}", self.0)
    }
}

/// Basic induction variable: a header phi advanced by a constant step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InductionVariable {
    /// Header phi holding the value at the top of each iteration.
    pub phi: ValueId,
    /// Incoming value from the preheader.
    pub start: Operand,
    pub step: i64,
    /// The instruction computing `phi + step`, fed back from the latch.
    pub increment: ValueId,
}

/// The header's `iv <pred> bound` test deciding whether another iteration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCondition {
    pub compare: ValueId,
    pub bound: Operand,
    /// Predicate that holds while the loop keeps iterating, with the
    /// induction variable on the left.
    pub continue_predicate: Predicate,
    /// Header successor inside the loop.
    pub body_entry: BlockId,
    /// Header successor outside the loop.
    pub exit: BlockId,
}

#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub header: BlockId,
    pub latches: SmallVec<[BlockId; 2]>,
    pub back_edges: SmallVec<[(BlockId, BlockId); 2]>,
    /// Member blocks in reverse post-order, header first.
    pub blocks: Vec<BlockId>,
    /// Membership bit set indexed by block id.
    pub body_mask: BitVec<u32>,
    /// Blocks outside the loop targeted from inside it.
    pub exits: SmallVec<[BlockId; 2]>,
    /// Single out-of-loop predecessor of the header whose only successor is the header.
    pub preheader: Option<BlockId>,
    pub parent: Option<LoopId>,
    pub children: SmallVec<[LoopId; 2]>,
    pub induction: Option<InductionVariable>,
    pub exit_condition: Option<ExitCondition>,
}

impl Loop {
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body_mask
            .get(block.0 as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// The latch, when the loop has exactly one.
    #[inline]
    pub fn latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    /// The exit block, when the loop has exactly one.
    #[inline]
    pub fn exit_block(&self) -> Option<BlockId> {
        match self.exits.as_slice() {
            [exit] => Some(*exit),
            _ => None,
        }
    }

    /// Member blocks other than the header and the latches, in reverse post-order.
    pub fn body(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .copied()
            .filter(move |block| *block != self.header && !self.latches.contains(block))
    }

    #[inline]
    pub fn is_innermost(&self) -> bool {
        self.children.is_empty()
    }

    fn rebuild_mask(&mut self, bound: usize) {
        let mut mask: BitVec<u32> = bitvec![u32, Lsb0; 0; bound];
        for block in self.blocks.iter() {
            let idx = block.0 as usize;
            if idx < bound {
                mask.set(idx, true);
            }
        }
        self.body_mask = mask;
    }
}

/// All loops of a function plus a block -> innermost loop index.
#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: BTreeMap<LoopId, Loop>,
    /// Innermost loop containing each block.
    block_map: HashMap<BlockId, LoopId>,
    /// Loop ids by header reverse post-order.
    order: Vec<LoopId>,
}

impl LoopForest {
    #[inline]
    pub fn get(&self, id: LoopId) -> Option<&Loop> {
        self.loops.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Loop> {
        self.order.iter().filter_map(move |id| self.loops.get(id))
    }

    /// Innermost loop containing `block`.
    #[inline]
    pub fn loop_for(&self, block: BlockId) -> Option<LoopId> {
        self.block_map.get(&block).copied()
    }

    pub fn loop_with_header(&self, header: BlockId) -> Option<LoopId> {
        self.loops
            .values()
            .find(|lp| lp.header == header)
            .map(|lp| lp.id)
    }

    /// Innermost loops in header reverse post-order: the sequence the chain
    /// driver assigns anchor and candidate roles over.
    pub fn discovery_order(&self) -> Vec<LoopId> {
        self.iter()
            .filter(|lp| lp.is_innermost())
            .map(|lp| lp.id)
            .collect()
    }

    /// Merge `fused` into `anchor` after the CFG surgery has been applied to `func`.
    ///
    /// The anchor takes over the fused loop's surviving blocks and its exit; blocks in
    /// `removed` disappear from every loop, and `fused` leaves the forest.
    pub fn absorb(
        &mut self,
        func: &Function,
        anchor: LoopId,
        fused: LoopId,
        removed: &[BlockId],
    ) -> Result<(), FusionError> {
        let fused_loop: Loop = self
            .loops
            .remove(&fused)
            .ok_or(FusionError::MissingLoop { loop_id: fused })?;
        if !self.loops.contains_key(&anchor) {
            self.loops.insert(fused, fused_loop);
            return Err(FusionError::MissingLoop { loop_id: anchor });
        }
        self.order.retain(|id| *id != fused);

        let rpo: Vec<BlockId> = ControlFlowAnalyzer::reverse_postorder(func);
        let rpo_index: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let bound: usize = func.block_id_bound();

        for lp in self.loops.values_mut() {
            lp.blocks.retain(|block| !removed.contains(block));
            lp.children.retain(|child| *child != fused);
            if lp.id == anchor {
                for block in fused_loop.blocks.iter() {
                    if !removed.contains(block) && !lp.blocks.contains(block) {
                        lp.blocks.push(*block);
                    }
                }
                lp.blocks
                    .sort_by_key(|block| rpo_index.get(block).copied().unwrap_or(usize::MAX));
                lp.exits = fused_loop.exits.clone();
                if let (Some(cond), Some(exit)) =
                    (lp.exit_condition.as_mut(), fused_loop.exit_block())
                {
                    cond.exit = exit;
                }
            }
            lp.rebuild_mask(bound);
        }

        self.block_map.retain(|block, _| !removed.contains(block));
        for owner in self.block_map.values_mut() {
            if *owner == fused {
                *owner = anchor;
            }
        }

        log::debug!(
            "{}: absorbed {} into {} ({} block(s) removed)",
            func.name,
            fused,
            anchor,
            removed.len()
        );
        Ok(())
    }
}

/// Loop analyzer for natural loops.
pub struct LoopAnalyzer;

impl LoopAnalyzer {
    /// Discover every natural loop of `func`.
    pub fn analyze_loops(func: &Function) -> LoopForest {
        let dom: DominatorTree = DominatorTree::compute(func);
        let preds = func.predecessor_map();
        let bound: usize = func.block_id_bound();

        // Back edges grouped by header, headers kept in RPO.
        let mut latches_by_header: BTreeMap<usize, (BlockId, SmallVec<[BlockId; 2]>)> =
            BTreeMap::new();
        for &block in dom.order() {
            for succ in func.successors(block) {
                if dom.dominates(succ, block) {
                    let key = dom.rpo_index(succ).unwrap_or(usize::MAX);
                    let entry = latches_by_header
                        .entry(key)
                        .or_insert_with(|| (succ, SmallVec::new()));
                    if !entry.1.contains(&block) {
                        entry.1.push(block);
                    }
                }
            }
        }

        let mut loops: BTreeMap<LoopId, Loop> = BTreeMap::new();
        let mut order: Vec<LoopId> = Vec::with_capacity(latches_by_header.len());

        for (next_id, (_, (header, latches))) in latches_by_header.into_iter().enumerate() {
            let id = LoopId(next_id as u32);

            // Walk predecessors backwards from every latch, stopping at the header.
            let mut mask: BitVec<u32> = bitvec![u32, Lsb0; 0; bound];
            mask.set(header.0 as usize, true);
            let mut worklist: Vec<BlockId> = Vec::new();
            for &latch in latches.iter() {
                if !mask[latch.0 as usize] {
                    mask.set(latch.0 as usize, true);
                    worklist.push(latch);
                }
            }
            while let Some(block) = worklist.pop() {
                for &pred in preds.get(&block).map(|p| p.as_slice()).unwrap_or(&[]) {
                    // Unreachable predecessors are not part of any loop.
                    if dom.rpo_index(pred).is_none() {
                        continue;
                    }
                    let idx = pred.0 as usize;
                    if !mask[idx] {
                        mask.set(idx, true);
                        worklist.push(pred);
                    }
                }
            }

            let blocks: Vec<BlockId> = dom
                .order()
                .iter()
                .copied()
                .filter(|block| mask[block.0 as usize])
                .collect();

            let mut exits: SmallVec<[BlockId; 2]> = SmallVec::new();
            for &block in blocks.iter() {
                for succ in func.successors(block) {
                    if !mask[succ.0 as usize] && !exits.contains(&succ) {
                        exits.push(succ);
                    }
                }
            }

            let outside_preds: SmallVec<[BlockId; 2]> = preds
                .get(&header)
                .map(|p| p.iter().copied().filter(|b| !mask[b.0 as usize]).collect())
                .unwrap_or_default();
            let preheader: Option<BlockId> = match outside_preds.as_slice() {
                [only] if func.successors(*only).as_slice() == [header] => Some(*only),
                _ => None,
            };

            let back_edges: SmallVec<[(BlockId, BlockId); 2]> =
                latches.iter().map(|latch| (*latch, header)).collect();

            let mut lp = Loop {
                id,
                header,
                latches,
                back_edges,
                blocks,
                body_mask: mask,
                exits,
                preheader,
                parent: None,
                children: SmallVec::new(),
                induction: None,
                exit_condition: None,
            };
            let (induction, exit_condition) = Self::recognise_header(func, &lp);
            lp.induction = induction;
            lp.exit_condition = exit_condition;

            log::debug!(
                "{}: {} header {} with {} block(s), {} latch(es), {} exit(s)",
                func.name,
                id,
                header,
                lp.blocks.len(),
                lp.latches.len(),
                lp.exits.len()
            );
            order.push(id);
            loops.insert(id, lp);
        }

        // Nesting: the parent is the smallest other loop containing the header.
        let ids: Vec<LoopId> = loops.keys().copied().collect();
        let mut parents: Vec<(LoopId, LoopId)> = Vec::new();
        for &inner in ids.iter() {
            let header = loops[&inner].header;
            let parent = ids
                .iter()
                .filter(|outer| **outer != inner && loops[*outer].contains(header))
                .min_by_key(|outer| loops[*outer].blocks.len())
                .copied();
            if let Some(parent) = parent {
                parents.push((inner, parent));
            }
        }
        for (inner, parent) in parents {
            if let Some(lp) = loops.get_mut(&inner) {
                lp.parent = Some(parent);
            }
            if let Some(lp) = loops.get_mut(&parent) {
                lp.children.push(inner);
            }
        }

        // Innermost owner per block.
        let mut block_map: HashMap<BlockId, LoopId> = HashMap::new();
        for lp in loops.values() {
            for &block in lp.blocks.iter() {
                let replace = match block_map.get(&block) {
                    Some(current) => loops[current].blocks.len() > lp.blocks.len(),
                    None => true,
                };
                if replace {
                    block_map.insert(block, lp.id);
                }
            }
        }

        LoopForest {
            loops,
            block_map,
            order,
        }
    }

    /// Recognise the induction variable and the exit test in a loop header.
    ///
    /// # Returns
    /// `(induction, exit_condition)`; either may be `None` for loops that are not
    /// in the canonical `phi / compare / branch` header form.
    fn recognise_header(
        func: &Function,
        lp: &Loop,
    ) -> (Option<InductionVariable>, Option<ExitCondition>) {
        let header = match func.block(lp.header) {
            Some(block) => block,
            None => return (None, None),
        };
        let (preheader, latch) = match (lp.preheader, lp.latch()) {
            (Some(preheader), Some(latch)) => (preheader, latch),
            _ => return (None, None),
        };

        let mut candidates: SmallVec<[InductionVariable; 2]> = SmallVec::new();
        for phi in header.phis.iter() {
            if phi.incoming.len() != 2 {
                continue;
            }
            let (start, next) = match (phi.incoming_for(preheader), phi.incoming_for(latch)) {
                (Some(start), Some(Operand::Value(next))) => (start, next),
                _ => continue,
            };
            let inst = match func.defining_instruction(next) {
                Some(inst) => inst,
                None => continue,
            };
            let phi_op = Operand::Value(phi.result);
            let step: Option<i64> = match &inst.kind {
                InstKind::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                } if *lhs == phi_op => rhs.as_const(),
                InstKind::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                } if *rhs == phi_op => lhs.as_const(),
                InstKind::Binary {
                    op: BinaryOp::Sub,
                    lhs,
                    rhs,
                } if *lhs == phi_op => rhs.as_const().and_then(i64::checked_neg),
                _ => None,
            };
            if let Some(step) = step.filter(|s| *s != 0) {
                candidates.push(InductionVariable {
                    phi: phi.result,
                    start,
                    step,
                    increment: next,
                });
            }
        }

        let exit_condition = Self::recognise_exit(func, lp, header.id, &candidates);
        let induction = match &exit_condition {
            Some((phi, _)) => candidates.iter().find(|iv| iv.phi == *phi).cloned(),
            None => candidates.first().cloned(),
        };
        (induction, exit_condition.map(|(_, cond)| cond))
    }

    fn recognise_exit(
        func: &Function,
        lp: &Loop,
        header: BlockId,
        candidates: &[InductionVariable],
    ) -> Option<(ValueId, ExitCondition)> {
        let block = func.block(header)?;
        let (cond, then_dest, else_dest) = match &block.terminator {
            Terminator::Branch {
                cond: Operand::Value(cond),
                then_dest,
                else_dest,
            } => (*cond, *then_dest, *else_dest),
            _ => return None,
        };
        let compare = block
            .instructions
            .iter()
            .find(|inst| inst.result == Some(cond))?;
        let (pred, lhs, rhs) = match &compare.kind {
            InstKind::Compare { pred, lhs, rhs } => (*pred, *lhs, *rhs),
            _ => return None,
        };

        let (iv, bound, pred) = candidates.iter().find_map(|iv| {
            let phi = Operand::Value(iv.phi);
            if lhs == phi {
                Some((iv.phi, rhs, pred))
            } else if rhs == phi {
                Some((iv.phi, lhs, pred.swapped()))
            } else {
                None
            }
        })?;

        let (continue_predicate, body_entry, exit) =
            match (lp.contains(then_dest), lp.contains(else_dest)) {
                (true, false) => (pred, then_dest, else_dest),
                (false, true) => (pred.inverse(), else_dest, then_dest),
                _ => return None,
            };

        Some((
            iv,
            ExitCondition {
                compare: cond,
                bound,
                continue_predicate,
                body_entry,
                exit,
            },
        ))
    }
}
