//! Fusion Legality
//!
//! Decides whether two control-flow-adjacent loops can be merged without
//! changing program behaviour. The checker is a pure query: it never mutates the
//! function, and every access recurrence it uses is extracted up front.
//!
//! # Checks
//! In order, for loop A (runs first) and loop B (runs second):
//! 1. **Shape**: canonical single-latch, single-exit loops with a recognised
//!    induction variable; both latches and B's header carry nothing but loop control
//! 2. **Adjacency**: A's exit block is empty and falls straight into B's header
//! 3. **Trip count**: the symbolic trip counts are equal
//! 4. **Bound**: both headers compare against the same bound operand
//! 5. **Latch shape**: same leading latch opcode, terminator kind and step
//! 6. **Induction**: both induction recurrences have equal start and step
//! 7. **Opaque access**: no access in either loop has an unknown address
//! 8. **Dependence**: no store/load pair on the same base has a non-zero
//!    distance, and no value produced in A is read in B
//!
//! Accesses through different base pointers are assumed not to alias.

use crate::analysis::access::{AccessExtractor, AccessKind, AffineAccess};
use crate::analysis::loop_analysis::{ExitCondition, InductionVariable, Loop, LoopForest, LoopId};
use crate::analysis::scalar_evolution::{Expr, ScalarEvolution};
use crate::error::FusionError;
use crate::ir::function::Function;
use crate::ir::instruction::{BlockId, Operand, Terminator, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Why a pair cannot be fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IllegalReason {
    UnsupportedShape,
    AdjacencyFail,
    TripCountMismatch,
    BoundMismatch,
    LatchMismatch,
    InductionMismatch,
    OpaqueAccess,
    DependenceViolation,
}

impl IllegalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IllegalReason::UnsupportedShape => "unsupported-shape",
            IllegalReason::AdjacencyFail => "adjacency-fail",
            IllegalReason::TripCountMismatch => "trip-count-mismatch",
            IllegalReason::BoundMismatch => "bound-mismatch",
            IllegalReason::LatchMismatch => "latch-mismatch",
            IllegalReason::InductionMismatch => "induction-mismatch",
            IllegalReason::OpaqueAccess => "opaque-access",
            IllegalReason::DependenceViolation => "dependence-violation",
        }
    }
}

impl fmt::Display for IllegalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Legal,
    Illegal(IllegalReason),
}

impl Verdict {
    #[inline]
    pub fn is_legal(&self) -> bool {
        matches!(self, Verdict::Legal)
    }
}

/// An ordered pair of loops and the checker's verdict on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionCandidate {
    pub first: LoopId,
    pub second: LoopId,
    pub verdict: Verdict,
}

/// The pieces of a canonical loop the checker and the transformer rely on.
#[derive(Debug, Clone, Copy)]
pub struct LoopShape<'l> {
    pub header: BlockId,
    pub latch: BlockId,
    pub preheader: BlockId,
    pub exit: BlockId,
    pub induction: &'l InductionVariable,
    pub exit_condition: &'l ExitCondition,
}

impl<'l> LoopShape<'l> {
    /// `None` unless `lp` is an innermost loop with one latch jumping back to the
    /// header, a preheader, and a single exit taken only from the header.
    pub fn of(func: &Function, lp: &'l Loop) -> Option<LoopShape<'l>> {
        if !lp.is_innermost() {
            return None;
        }
        let latch = lp.latch()?;
        let preheader = lp.preheader?;
        let exit = lp.exit_block()?;
        let induction = lp.induction.as_ref()?;
        let exit_condition = lp.exit_condition.as_ref()?;
        if exit_condition.exit != exit {
            return None;
        }
        match func.block(latch).map(|block| &block.terminator) {
            Some(Terminator::Jump(target)) if *target == lp.header => {}
            _ => return None,
        }
        let exits_elsewhere = lp
            .blocks
            .iter()
            .filter(|block| **block != lp.header)
            .any(|block| func.successors(*block).iter().any(|succ| !lp.contains(*succ)));
        if exits_elsewhere {
            return None;
        }
        Some(LoopShape {
            header: lp.header,
            latch,
            preheader,
            exit,
            induction,
            exit_condition,
        })
    }
}

/// Legality checker for one function and its loop forest.
pub struct LegalityChecker<'a> {
    func: &'a Function,
    forest: &'a LoopForest,
}

impl<'a> LegalityChecker<'a> {
    pub fn new(func: &'a Function, forest: &'a LoopForest) -> Self {
        Self { func, forest }
    }

    /// Check whether `first` followed by `second` can be fused.
    ///
    /// # Errors
    /// `FusionError::MissingLoop` when either id is not in the forest. An illegal
    /// pair is not an error; it is reported in the candidate's verdict.
    pub fn check(&self, first: LoopId, second: LoopId) -> Result<FusionCandidate, FusionError> {
        let a = self
            .forest
            .get(first)
            .ok_or(FusionError::MissingLoop { loop_id: first })?;
        let b = self
            .forest
            .get(second)
            .ok_or(FusionError::MissingLoop { loop_id: second })?;

        let verdict = match self.evaluate(a, b) {
            Ok(()) => Verdict::Legal,
            Err(reason) => Verdict::Illegal(reason),
        };
        match verdict {
            Verdict::Legal => log::info!(
                "{}: {} and {} are fusible",
                self.func.name,
                self.func.label_of(a.header),
                self.func.label_of(b.header)
            ),
            Verdict::Illegal(reason) => log::info!(
                "{}: {} and {} cannot be fused: {}",
                self.func.name,
                self.func.label_of(a.header),
                self.func.label_of(b.header),
                reason
            ),
        }

        Ok(FusionCandidate {
            first,
            second,
            verdict,
        })
    }

    fn evaluate(&self, a: &Loop, b: &Loop) -> Result<(), IllegalReason> {
        if a.id == b.id {
            return Err(IllegalReason::AdjacencyFail);
        }
        let shape_a = LoopShape::of(self.func, a).ok_or(IllegalReason::UnsupportedShape)?;
        let shape_b = LoopShape::of(self.func, b).ok_or(IllegalReason::UnsupportedShape)?;
        self.check_control_only(&shape_a, &shape_b)?;
        self.check_adjacency(&shape_a, &shape_b)?;

        let mut scev = ScalarEvolution::new(self.func, self.forest);

        let trip_a = scev.trip_count(a.id);
        let trip_b = scev.trip_count(b.id);
        log::debug!("{}: trip counts {} / {}", self.func.name, trip_a, trip_b);
        if !trip_a.subtract(&trip_b).is_zero() {
            return Err(IllegalReason::TripCountMismatch);
        }

        if shape_a.exit_condition.bound != shape_b.exit_condition.bound {
            return Err(IllegalReason::BoundMismatch);
        }

        self.check_latch(&shape_a, &shape_b)?;

        let iv_a = scev.expr_for(Operand::Value(shape_a.induction.phi));
        let iv_b = scev
            .expr_for(Operand::Value(shape_b.induction.phi))
            .rebind(a.id);
        if !iv_b.subtract(&iv_a).is_zero() {
            return Err(IllegalReason::InductionMismatch);
        }

        // Every access of both loops is extracted before any dependence reasoning.
        let accesses_a: Vec<AffineAccess> = AccessExtractor::extract(&mut scev, a);
        let accesses_b: Vec<AffineAccess> = AccessExtractor::extract(&mut scev, b);
        if accesses_a
            .iter()
            .chain(accesses_b.iter())
            .any(|access| access.pattern.is_opaque())
        {
            return Err(IllegalReason::OpaqueAccess);
        }

        self.check_scalar_dependence(a, b)?;
        Self::check_memory_dependence(a.id, &accesses_a, &accesses_b)
    }

    /// Once fused, A's latch runs after B's body and B's header and latch are
    /// deleted. Both latches may hold only their induction increment, and B's
    /// header only its induction phi and exit compare.
    fn check_control_only(&self, a: &LoopShape<'_>, b: &LoopShape<'_>) -> Result<(), IllegalReason> {
        if !self.latch_is_increment_only(a) || !self.latch_is_increment_only(b) {
            log::debug!("{}: latch carries more than the induction increment", self.func.name);
            return Err(IllegalReason::UnsupportedShape);
        }
        let header = self
            .func
            .block(b.header)
            .ok_or(IllegalReason::UnsupportedShape)?;

        let header_ok = header.phis.len() == 1
            && header.phis[0].result == b.induction.phi
            && header.instructions.len() == 1
            && header.instructions[0].result == Some(b.exit_condition.compare);
        let single_use = self.func.use_count(b.exit_condition.compare) == 1
            && self.func.use_count(b.induction.increment) == 1;

        if header_ok && single_use {
            Ok(())
        } else {
            Err(IllegalReason::UnsupportedShape)
        }
    }

    #[inline]
    fn latch_is_increment_only(&self, shape: &LoopShape<'_>) -> bool {
        self.func
            .block(shape.latch)
            .map(|latch| {
                latch.phis.is_empty()
                    && latch.instructions.len() == 1
                    && latch.instructions[0].result == Some(shape.induction.increment)
            })
            .unwrap_or(false)
    }

    fn check_adjacency(&self, a: &LoopShape<'_>, b: &LoopShape<'_>) -> Result<(), IllegalReason> {
        let between = self
            .func
            .block(a.exit)
            .ok_or(IllegalReason::AdjacencyFail)?;
        let falls_into_b = between.successors().as_slice() == [b.header];
        let empty = between.phis.is_empty() && between.instructions.is_empty();
        let only_from_a = self.func.predecessors(a.exit).as_slice() == [a.header];
        if falls_into_b && empty && only_from_a && b.preheader == a.exit {
            Ok(())
        } else {
            Err(IllegalReason::AdjacencyFail)
        }
    }

    fn check_latch(&self, a: &LoopShape<'_>, b: &LoopShape<'_>) -> Result<(), IllegalReason> {
        let (latch_a, latch_b) = match (self.func.block(a.latch), self.func.block(b.latch)) {
            (Some(latch_a), Some(latch_b)) => (latch_a, latch_b),
            _ => return Err(IllegalReason::LatchMismatch),
        };
        let opcode_a = latch_a.instructions.first().map(|inst| inst.opcode());
        let opcode_b = latch_b.instructions.first().map(|inst| inst.opcode());
        if opcode_a == opcode_b
            && latch_a.terminator.kind() == latch_b.terminator.kind()
            && a.induction.step == b.induction.step
        {
            Ok(())
        } else {
            Err(IllegalReason::LatchMismatch)
        }
    }

    /// A value computed inside A and read inside B would be observed per
    /// iteration after fusion instead of once after A finished.
    fn check_scalar_dependence(&self, a: &Loop, b: &Loop) -> Result<(), IllegalReason> {
        let produced: HashSet<ValueId> = a
            .blocks
            .iter()
            .filter_map(|id| self.func.block(*id))
            .flat_map(|block| block.defined_values())
            .collect();
        let consumed = b
            .blocks
            .iter()
            .filter_map(|id| self.func.block(*id))
            .flat_map(|block| block.used_values());
        for value in consumed {
            if produced.contains(&value) {
                log::debug!("{}: {} flows from A into B", self.func.name, value);
                return Err(IllegalReason::DependenceViolation);
            }
        }
        Ok(())
    }

    /// Rewrite each B access into A's iteration space and compare it with every
    /// conflicting A access.
    ///
    /// Only a distance of exactly zero is accepted on a shared base: a positive
    /// distance means B reads an element A has not written yet in the fused loop.
    fn check_memory_dependence(
        anchor: LoopId,
        accesses_a: &[AffineAccess],
        accesses_b: &[AffineAccess],
    ) -> Result<(), IllegalReason> {
        for first in accesses_a.iter() {
            for second in accesses_b.iter() {
                if first.kind == AccessKind::Load && second.kind == AccessKind::Load {
                    continue;
                }
                if let (Some(base_a), Some(base_b)) = (first.base, second.base) {
                    if base_a != base_b {
                        continue;
                    }
                }
                let (rec_a, rec_b) =
                    match (first.pattern.recurrence(), second.pattern.recurrence()) {
                        (Some(rec_a), Some(rec_b)) => (rec_a, rec_b),
                        _ => return Err(IllegalReason::OpaqueAccess),
                    };

                let distance: Expr = rec_b
                    .rebind(anchor)
                    .to_expr()
                    .subtract(&rec_a.to_expr());
                log::debug!("dependence {} -> {}: distance {}", first, second, distance);
                if !distance.is_computable() || distance.is_known_negative() {
                    return Err(IllegalReason::DependenceViolation);
                }
                // A positive or varying distance reads ahead of the producer.
                if distance.as_constant() != Some(0) {
                    return Err(IllegalReason::DependenceViolation);
                }
            }
        }
        Ok(())
    }
}
