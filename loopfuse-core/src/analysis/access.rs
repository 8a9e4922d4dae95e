//! Affine Access Extraction
//!
//! Classifies every load and store of a loop by how its address evolves over the
//! loop's iterations: a known affine recurrence `start + step * iteration`, or
//! `Opaque` when the address cannot be expressed that way.
//!
//! # Algorithm
//! For each block of the loop (header, body and latch alike), stores first and
//! then loads:
//! 1. Build the symbolic expression of the pointer operand
//! 2. A recurrence over this loop with loop-invariant start and step is `Known`
//! 3. A loop-invariant linear address is `Known` with step zero
//! 4. Everything else is `Opaque`
//!
//! Extraction is a pure query. Results describe the CFG they were computed on and
//! must not be reused after it is mutated.

use crate::analysis::loop_analysis::{Loop, LoopId};
use crate::analysis::scalar_evolution::{AddRec, Expr, LinearExpr, ScalarEvolution};
use crate::ir::function::Function;
use crate::ir::instruction::{BlockId, InstKind, Operand, ValueId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Load,
    Store,
    /// A call, which may read and write any memory.
    Call,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Load => write!(f, "load"),
            AccessKind::Store => write!(f, "store"),
            AccessKind::Call => write!(f, "call"),
        }
    }
}

/// `start + step * iteration` relative to `loop_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineRecurrence {
    pub start: LinearExpr,
    pub step: LinearExpr,
    pub loop_id: LoopId,
}

impl AffineRecurrence {
    #[inline]
    pub fn to_expr(&self) -> Expr {
        Expr::AddRec(AddRec {
            start: self.start.clone(),
            step: self.step.clone(),
            loop_id: self.loop_id,
        })
    }

    /// Same start and step, attributed to another loop.
    pub fn rebind(&self, loop_id: LoopId) -> AffineRecurrence {
        AffineRecurrence {
            start: self.start.clone(),
            step: self.step.clone(),
            loop_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPattern {
    Known(AffineRecurrence),
    Opaque,
}

impl AccessPattern {
    #[inline]
    pub fn recurrence(&self) -> Option<&AffineRecurrence> {
        match self {
            AccessPattern::Known(rec) => Some(rec),
            AccessPattern::Opaque => None,
        }
    }

    #[inline]
    pub fn is_opaque(&self) -> bool {
        matches!(self, AccessPattern::Opaque)
    }
}

/// One memory instruction of a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineAccess {
    pub kind: AccessKind,
    pub block: BlockId,
    /// Position in the block's instruction list.
    pub index: usize,
    /// Address operand; `None` for calls.
    pub pointer: Option<Operand>,
    /// Root of the address computation, when it is an SSA value.
    pub base: Option<ValueId>,
    pub pattern: AccessPattern,
}

impl fmt::Display for AffineAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            AccessPattern::Known(rec) => write!(
                f,
                "{} {}[{}] via {}",
                self.kind,
                self.block,
                self.index,
                rec.to_expr()
            ),
            AccessPattern::Opaque => write!(
                f,
                "{} {}[{}] (opaque)",
                self.kind, self.block, self.index
            ),
        }
    }
}

pub struct AccessExtractor;

impl AccessExtractor {
    /// All accesses of `lp`: stores and calls first, then loads, each in block order.
    pub fn extract(scev: &mut ScalarEvolution<'_>, lp: &Loop) -> Vec<AffineAccess> {
        let func: &Function = scev.function();
        let mut stores: Vec<AffineAccess> = Vec::new();
        let mut loads: Vec<AffineAccess> = Vec::new();

        for &block_id in lp.blocks.iter() {
            let block = match func.block(block_id) {
                Some(block) => block,
                None => continue,
            };
            for (index, inst) in block.instructions.iter().enumerate() {
                let (kind, pointer) = match &inst.kind {
                    InstKind::Store { ptr, .. } => (AccessKind::Store, Some(*ptr)),
                    InstKind::Load { ptr } => (AccessKind::Load, Some(*ptr)),
                    InstKind::Call { .. } => (AccessKind::Call, None),
                    _ => continue,
                };
                let pattern = match pointer {
                    Some(pointer) => Self::classify(scev, lp, pointer),
                    None => AccessPattern::Opaque,
                };
                let access = AffineAccess {
                    kind,
                    block: block_id,
                    index,
                    pointer,
                    base: pointer.and_then(|pointer| Self::base_pointer(func, pointer)),
                    pattern,
                };
                log::debug!("{}: {} {}", func.name, lp.id, access);
                match kind {
                    AccessKind::Load => loads.push(access),
                    AccessKind::Store | AccessKind::Call => stores.push(access),
                }
            }
        }

        stores.extend(loads);
        stores
    }

    fn classify(scev: &mut ScalarEvolution<'_>, lp: &Loop, pointer: Operand) -> AccessPattern {
        match scev.expr_for(pointer) {
            Expr::AddRec(rec)
                if rec.loop_id == lp.id
                    && scev.is_invariant(&rec.start, lp)
                    && scev.is_invariant(&rec.step, lp) =>
            {
                AccessPattern::Known(AffineRecurrence {
                    start: rec.start,
                    step: rec.step,
                    loop_id: rec.loop_id,
                })
            }
            Expr::Linear(lin) if scev.is_invariant(&lin, lp) => {
                AccessPattern::Known(AffineRecurrence {
                    start: lin,
                    step: LinearExpr::default(),
                    loop_id: lp.id,
                })
            }
            _ => AccessPattern::Opaque,
        }
    }

    /// Follow `ElementPtr` bases back to the root pointer value.
    pub fn base_pointer(func: &Function, pointer: Operand) -> Option<ValueId> {
        let mut current: ValueId = pointer.as_value()?;
        // Bounded by the number of instructions: SSA address chains cannot cycle
        // without a phi, which stops the walk.
        for _ in 0..=func.blocks.iter().map(|b| b.instructions.len()).sum::<usize>() {
            match func.defining_instruction(current).map(|inst| &inst.kind) {
                Some(InstKind::ElementPtr {
                    base: Operand::Value(base),
                    ..
                }) => current = *base,
                _ => return Some(current),
            }
        }
        Some(current)
    }
}
