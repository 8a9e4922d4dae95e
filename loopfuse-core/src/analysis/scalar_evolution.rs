//! Scalar Evolution
//!
//! Symbolic expressions for SSA values: linear combinations of opaque atoms and
//! affine recurrences `{start, +, step}<loop>` over a loop's iterations.
//!
//! # Expression Forms
//! - `Linear`: `c + k1*a1 + k2*a2 + ...` where each `a` is an SSA value treated as an unknown
//! - `AddRec`: `start + step * iteration` with linear start and step, attributed to one loop
//! - `CouldNotCompute`: anything else (products of variables, mixed loops, overflow)
//!
//! Differences are computed symbolically; two expressions are equal when their
//! difference reduces to the zero expression. All arithmetic is checked and
//! overflow yields `CouldNotCompute`.

use crate::analysis::loop_analysis::{Loop, LoopForest, LoopId};
use crate::ir::function::{DefSite, Function};
use crate::ir::instruction::{BinaryOp, InstKind, Operand, Predicate, ValueId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// `constant + sum(coefficient * atom)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LinearExpr {
    pub constant: i64,
    /// Non-zero coefficients only.
    pub terms: BTreeMap<ValueId, i64>,
}

impl LinearExpr {
    #[inline]
    pub fn constant(value: i64) -> Self {
        Self {
            constant: value,
            terms: BTreeMap::new(),
        }
    }

    pub fn atom(value: ValueId) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(value, 1i64);
        Self { constant: 0, terms }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.constant == 0 && self.terms.is_empty()
    }

    #[inline]
    pub fn as_constant(&self) -> Option<i64> {
        if self.terms.is_empty() {
            Some(self.constant)
        } else {
            None
        }
    }

    pub fn checked_add(&self, other: &LinearExpr) -> Option<LinearExpr> {
        let mut result = self.clone();
        result.constant = result.constant.checked_add(other.constant)?;
        for (atom, coeff) in other.terms.iter() {
            let entry = result.terms.entry(*atom).or_insert(0);
            *entry = entry.checked_add(*coeff)?;
            if *entry == 0 {
                result.terms.remove(atom);
            }
        }
        Some(result)
    }

    pub fn checked_scale(&self, factor: i64) -> Option<LinearExpr> {
        if factor == 0 {
            return Some(LinearExpr::default());
        }
        let mut terms = BTreeMap::new();
        for (atom, coeff) in self.terms.iter() {
            terms.insert(*atom, coeff.checked_mul(factor)?);
        }
        Some(LinearExpr {
            constant: self.constant.checked_mul(factor)?,
            terms,
        })
    }

    #[inline]
    pub fn checked_sub(&self, other: &LinearExpr) -> Option<LinearExpr> {
        self.checked_add(&other.checked_scale(-1)?)
    }

    /// Atoms the expression depends on.
    pub fn atoms(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.terms.keys().copied()
    }
}

impl fmt::Display for LinearExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (atom, coeff) in self.terms.iter() {
            if wrote {
                write!(f, " + ")?;
            }
            if *coeff == 1 {
                write!(f, "{}", atom)?;
            } else {
                write!(f, "{}*{}", coeff, atom)?;
            }
            wrote = true;
        }
        if !wrote {
            write!(f, "{}", self.constant)
        } else if self.constant != 0 {
            write!(f, " + {}", self.constant)
        } else {
            Ok(())
        }
    }
}

/// `start + step * iteration` over the iterations of `loop_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddRec {
    pub start: LinearExpr,
    pub step: LinearExpr,
    pub loop_id: LoopId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Linear(LinearExpr),
    AddRec(AddRec),
    CouldNotCompute,
}

impl Expr {
    #[inline]
    pub fn constant(value: i64) -> Self {
        Expr::Linear(LinearExpr::constant(value))
    }

    /// Add two expressions. Recurrences over different loops do not combine.
    pub fn add(&self, other: &Expr) -> Expr {
        let combined = match (self, other) {
            (Expr::Linear(a), Expr::Linear(b)) => a.checked_add(b).map(Expr::Linear),
            (Expr::Linear(lin), Expr::AddRec(rec)) | (Expr::AddRec(rec), Expr::Linear(lin)) => {
                rec.start.checked_add(lin).map(|start| {
                    Expr::AddRec(AddRec {
                        start,
                        step: rec.step.clone(),
                        loop_id: rec.loop_id,
                    })
                })
            }
            (Expr::AddRec(a), Expr::AddRec(b)) if a.loop_id == b.loop_id => {
                match (a.start.checked_add(&b.start), a.step.checked_add(&b.step)) {
                    (Some(start), Some(step)) => Some(Expr::AddRec(AddRec {
                        start,
                        step,
                        loop_id: a.loop_id,
                    })),
                    _ => None,
                }
            }
            _ => None,
        };
        combined.unwrap_or(Expr::CouldNotCompute)
    }

    pub fn scale(&self, factor: i64) -> Expr {
        let scaled = match self {
            Expr::Linear(lin) => lin.checked_scale(factor).map(Expr::Linear),
            Expr::AddRec(rec) => {
                match (rec.start.checked_scale(factor), rec.step.checked_scale(factor)) {
                    (Some(start), Some(step)) => Some(Expr::AddRec(AddRec {
                        start,
                        step,
                        loop_id: rec.loop_id,
                    })),
                    _ => None,
                }
            }
            Expr::CouldNotCompute => None,
        };
        scaled.unwrap_or(Expr::CouldNotCompute)
    }

    #[inline]
    pub fn negate(&self) -> Expr {
        self.scale(-1)
    }

    /// `self - other`
    #[inline]
    pub fn subtract(&self, other: &Expr) -> Expr {
        self.add(&other.negate())
    }

    #[inline]
    pub fn is_computable(&self) -> bool {
        !matches!(self, Expr::CouldNotCompute)
    }

    /// Is this the zero expression? A recurrence is zero when start and step both are.
    pub fn is_zero(&self) -> bool {
        match self {
            Expr::Linear(lin) => lin.is_zero(),
            Expr::AddRec(rec) => rec.start.is_zero() && rec.step.is_zero(),
            Expr::CouldNotCompute => false,
        }
    }

    /// Negative for every iteration: a negative constant start that never grows.
    pub fn is_known_negative(&self) -> bool {
        match self {
            Expr::Linear(lin) => lin.as_constant().map(|c| c < 0).unwrap_or(false),
            Expr::AddRec(rec) => matches!(
                (rec.start.as_constant(), rec.step.as_constant()),
                (Some(start), Some(step)) if start < 0 && step <= 0
            ),
            Expr::CouldNotCompute => false,
        }
    }

    /// Positive for every iteration: a positive constant start that never shrinks.
    pub fn is_known_positive(&self) -> bool {
        match self {
            Expr::Linear(lin) => lin.as_constant().map(|c| c > 0).unwrap_or(false),
            Expr::AddRec(rec) => matches!(
                (rec.start.as_constant(), rec.step.as_constant()),
                (Some(start), Some(step)) if start > 0 && step >= 0
            ),
            Expr::CouldNotCompute => false,
        }
    }

    /// The value, when it is the same constant for every iteration.
    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Expr::Linear(lin) => lin.as_constant(),
            Expr::AddRec(rec) if rec.step.is_zero() => rec.start.as_constant(),
            _ => None,
        }
    }

    /// Attribute a recurrence to another loop, keeping its start and step.
    pub fn rebind(&self, loop_id: LoopId) -> Expr {
        match self {
            Expr::AddRec(rec) => Expr::AddRec(AddRec {
                start: rec.start.clone(),
                step: rec.step.clone(),
                loop_id,
            }),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Linear(lin) => write!(f, "{}", lin),
            Expr::AddRec(rec) => write!(f, "{{{}, +, {}}}<{}>", rec.start, rec.step, rec.loop_id),
            Expr::CouldNotCompute => write!(f, "<could not compute>"),
        }
    }
}

/// Per-function expression builder with a value cache.
///
/// The cache is only valid for the function shape it was built against; a new
/// `ScalarEvolution` must be created after any CFG mutation.
pub struct ScalarEvolution<'a> {
    func: &'a Function,
    forest: &'a LoopForest,
    definitions: HashMap<ValueId, DefSite>,
    /// Induction phi -> owning loop.
    induction_phis: HashMap<ValueId, LoopId>,
    cache: HashMap<ValueId, Expr>,
}

impl<'a> ScalarEvolution<'a> {
    pub fn new(func: &'a Function, forest: &'a LoopForest) -> Self {
        let induction_phis = forest
            .iter()
            .filter_map(|lp| lp.induction.as_ref().map(|iv| (iv.phi, lp.id)))
            .collect();
        Self {
            func,
            forest,
            definitions: func.definitions(),
            induction_phis,
            cache: HashMap::new(),
        }
    }

    #[inline]
    pub fn function(&self) -> &'a Function {
        self.func
    }

    #[inline]
    pub fn forest(&self) -> &'a LoopForest {
        self.forest
    }

    /// Symbolic value of an operand.
    pub fn expr_for(&mut self, operand: Operand) -> Expr {
        match operand {
            Operand::Const(c) => Expr::constant(c),
            Operand::Value(value) => self.expr_for_value(value),
        }
    }

    fn expr_for_value(&mut self, value: ValueId) -> Expr {
        if let Some(expr) = self.cache.get(&value) {
            return expr.clone();
        }
        // Cycle guard: a value reached again while being computed is not affine.
        self.cache.insert(value, Expr::CouldNotCompute);
        let expr = self.compute(value);
        self.cache.insert(value, expr.clone());
        expr
    }

    fn compute(&mut self, value: ValueId) -> Expr {
        let site = match self.definitions.get(&value) {
            Some(site) => *site,
            None => return Expr::CouldNotCompute,
        };
        match site {
            DefSite::Param => Expr::Linear(LinearExpr::atom(value)),
            DefSite::Phi { .. } => self.compute_phi(value),
            DefSite::Instruction { block, index } => {
                let kind = match self
                    .func
                    .block(block)
                    .and_then(|b| b.instructions.get(index))
                {
                    Some(inst) => inst.kind.clone(),
                    None => return Expr::CouldNotCompute,
                };
                self.compute_instruction(value, &kind)
            }
        }
    }

    fn compute_phi(&mut self, value: ValueId) -> Expr {
        let (loop_id, start, step) = match self.induction_phis.get(&value) {
            Some(loop_id) => {
                let iv = self
                    .forest
                    .get(*loop_id)
                    .and_then(|lp| lp.induction.as_ref());
                match iv {
                    Some(iv) => (*loop_id, iv.start, iv.step),
                    None => return Expr::Linear(LinearExpr::atom(value)),
                }
            }
            // Not a recognised induction variable: an unknown.
            None => return Expr::Linear(LinearExpr::atom(value)),
        };
        match self.expr_for(start) {
            Expr::Linear(start) => Expr::AddRec(AddRec {
                start,
                step: LinearExpr::constant(step),
                loop_id,
            }),
            _ => Expr::CouldNotCompute,
        }
    }

    fn compute_instruction(&mut self, value: ValueId, kind: &InstKind) -> Expr {
        match kind {
            InstKind::Binary { op, lhs, rhs } => {
                let l = self.expr_for(*lhs);
                let r = self.expr_for(*rhs);
                match op {
                    BinaryOp::Add => l.add(&r),
                    BinaryOp::Sub => l.subtract(&r),
                    BinaryOp::Mul => match (l.as_constant(), r.as_constant()) {
                        (_, Some(c)) => l.scale(c),
                        (Some(c), _) => r.scale(c),
                        _ => Self::opaque_of(value, &[&l, &r]),
                    },
                    BinaryOp::Shl => match r.as_constant() {
                        Some(shift) if (0..63).contains(&shift) => l.scale(1i64 << shift),
                        _ => Self::opaque_of(value, &[&l, &r]),
                    },
                    _ => Self::opaque_of(value, &[&l, &r]),
                }
            }
            InstKind::ElementPtr { base, index, scale } => {
                let b = self.expr_for(*base);
                let i = self.expr_for(*index);
                b.add(&i.scale(*scale))
            }
            InstKind::Load { .. } | InstKind::Call { .. } | InstKind::Compare { .. } => {
                Expr::Linear(LinearExpr::atom(value))
            }
            InstKind::Store { .. } => Expr::CouldNotCompute,
        }
    }

    /// Result of an operation the engine does not model: an unknown atom, unless an
    /// operand already varies with a loop (hiding that variation would be unsound).
    fn opaque_of(value: ValueId, operands: &[&Expr]) -> Expr {
        if operands.iter().all(|e| matches!(e, Expr::Linear(_))) {
            Expr::Linear(LinearExpr::atom(value))
        } else {
            Expr::CouldNotCompute
        }
    }

    /// Is every atom of `expr` defined outside `lp`?
    pub fn is_invariant(&self, expr: &LinearExpr, lp: &Loop) -> bool {
        expr.atoms().all(|atom| match self.definitions.get(&atom) {
            Some(site) => site.block().map(|block| !lp.contains(block)).unwrap_or(true),
            None => false,
        })
    }

    /// Conservative upper bound on the number of iterations of `loop_id`.
    ///
    /// # Rules
    /// With induction start `S`, step `c` and bound `B`, for a loop that continues while
    /// `iv <pred> B`:
    /// - `Lt`: `B - S` (`c == 1`), or `ceil((B - S) / c)` for constant `B - S` and `c > 0`
    /// - `Le`: as `Lt` with `B + 1`
    /// - `Gt` / `Ge`: the mirror images for `c < 0`
    /// - `Ne`: `(B - S) / c` when `c` is `1` or `-1`, or the constant distance divides exactly
    ///
    /// Constant counts are clamped at zero. Symbolic counts stand for `max(0, count)`.
    pub fn trip_count(&mut self, loop_id: LoopId) -> Expr {
        let forest: &'a LoopForest = self.forest;
        let lp = match forest.get(loop_id) {
            Some(lp) => lp,
            None => return Expr::CouldNotCompute,
        };
        let (iv, cond) = match (&lp.induction, &lp.exit_condition) {
            (Some(iv), Some(cond)) => (iv.clone(), cond.clone()),
            _ => return Expr::CouldNotCompute,
        };
        let start = match self.expr_for(iv.start) {
            Expr::Linear(start) if self.is_invariant(&start, lp) => start,
            _ => return Expr::CouldNotCompute,
        };
        let bound = match self.expr_for(cond.bound) {
            Expr::Linear(bound) if self.is_invariant(&bound, lp) => bound,
            _ => return Expr::CouldNotCompute,
        };

        let (distance, step) = match cond.continue_predicate {
            Predicate::Lt if iv.step > 0 => (bound.checked_sub(&start), iv.step),
            Predicate::Le if iv.step > 0 => (
                bound
                    .checked_add(&LinearExpr::constant(1))
                    .and_then(|b| b.checked_sub(&start)),
                iv.step,
            ),
            Predicate::Gt if iv.step < 0 => (start.checked_sub(&bound), -iv.step),
            Predicate::Ge if iv.step < 0 => (
                start
                    .checked_add(&LinearExpr::constant(1))
                    .and_then(|s| s.checked_sub(&bound)),
                -iv.step,
            ),
            Predicate::Ne if iv.step > 0 => (bound.checked_sub(&start), iv.step),
            Predicate::Ne if iv.step < 0 => (start.checked_sub(&bound), -iv.step),
            _ => return Expr::CouldNotCompute,
        };
        let distance = match distance {
            Some(distance) => distance,
            None => return Expr::CouldNotCompute,
        };

        let exact = cond.continue_predicate == Predicate::Ne;
        match distance.as_constant() {
            Some(d) if exact => {
                if d >= 0 && d % step == 0 {
                    Expr::constant(d / step)
                } else {
                    Expr::CouldNotCompute
                }
            }
            Some(d) => {
                let count = if d <= 0 { 0 } else { (d - 1) / step + 1 };
                Expr::constant(count)
            }
            None if step == 1 => Expr::Linear(distance),
            None => Expr::CouldNotCompute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::loop_analysis::LoopAnalyzer;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::instruction::BlockId;

    /// for (i = start; i <pred> bound; i += step) { p = &x[i]; }
    fn counted(start: i64, pred: Predicate, bound: Operand, step: i64) -> Function {
        let mut b = FunctionBuilder::new("counted");
        let x = b.param("x");
        let _n = b.param("n");
        let entry = b.create_block("entry");
        let header = b.create_block("header");
        let latch = b.create_block("latch");
        let exit = b.create_block("exit");

        b.switch_to(entry);
        b.jump(header);

        b.switch_to(header);
        let i = b.phi(&[(entry, Operand::Const(start))]);
        let c = b.compare(pred, i, bound);
        b.branch(c, latch, exit);

        b.switch_to(latch);
        let _p = b.element_ptr(x, i, 4);
        let next = b.add(i, step);
        b.jump(header);
        b.add_phi_incoming(i, latch, next);

        b.switch_to(exit);
        b.ret(None);

        b.finish().unwrap_or_else(|e| panic!("counted loop should verify: {}", e))
    }

    fn trip(func: &Function) -> Expr {
        let forest = LoopAnalyzer::analyze_loops(func);
        let mut scev = ScalarEvolution::new(func, &forest);
        scev.trip_count(LoopId(0))
    }

    #[test]
    fn test_linear_arithmetic() {
        let a = LinearExpr::atom(ValueId(1));
        let b = LinearExpr::atom(ValueId(2));
        let sum = a.checked_add(&b).unwrap().checked_add(&LinearExpr::constant(3)).unwrap();
        let diff = sum.checked_sub(&a).unwrap();
        assert_eq!(diff.terms.len(), 1);
        assert_eq!(diff.constant, 3);
        assert!(sum.checked_sub(&sum).unwrap().is_zero());
        assert_eq!(LinearExpr::constant(i64::MAX).checked_add(&LinearExpr::constant(1)), None);
    }

    #[test]
    fn test_addrec_subtract() {
        let rec = |start: i64| {
            Expr::AddRec(AddRec {
                start: LinearExpr::constant(start),
                step: LinearExpr::constant(4),
                loop_id: LoopId(0),
            })
        };
        let diff = rec(0).subtract(&rec(4));
        assert!(diff.is_known_negative());
        assert_eq!(diff.as_constant(), Some(-4));
        assert!(rec(4).subtract(&rec(4)).is_zero());

        let other_loop = rec(0).rebind(LoopId(1));
        assert!(!rec(0).subtract(&other_loop).is_computable());
        assert!(rec(0).subtract(&other_loop.rebind(LoopId(0))).is_zero());
    }

    #[test]
    fn test_trip_count_constant() {
        assert_eq!(trip(&counted(0, Predicate::Lt, Operand::Const(10), 1)), Expr::constant(10));
        assert_eq!(trip(&counted(0, Predicate::Le, Operand::Const(9), 1)), Expr::constant(10));
        assert_eq!(trip(&counted(0, Predicate::Lt, Operand::Const(10), 3)), Expr::constant(4));
        assert_eq!(trip(&counted(10, Predicate::Gt, Operand::Const(0), -2)), Expr::constant(5));
        assert_eq!(trip(&counted(5, Predicate::Lt, Operand::Const(0), 1)), Expr::constant(0));
        assert!(!trip(&counted(0, Predicate::Ne, Operand::Const(10), 3)).is_computable());
    }

    #[test]
    fn test_trip_count_symbolic() {
        // Parameter `n` is value 1.
        let count = trip(&counted(2, Predicate::Lt, Operand::Value(ValueId(1)), 1));
        let mut expected = LinearExpr::atom(ValueId(1));
        expected.constant = -2;
        assert_eq!(count, Expr::Linear(expected));
        assert!(!trip(&counted(0, Predicate::Lt, Operand::Value(ValueId(1)), 2)).is_computable());
    }

    #[test]
    fn test_element_ptr_recurrence() {
        let func = counted(0, Predicate::Lt, Operand::Const(10), 1);
        let forest = LoopAnalyzer::analyze_loops(&func);
        let mut scev = ScalarEvolution::new(&func, &forest);
        let ptr = func
            .block(BlockId(2))
            .and_then(|b| b.instructions.first())
            .and_then(|inst| inst.result)
            .unwrap();
        match scev.expr_for(Operand::Value(ptr)) {
            Expr::AddRec(rec) => {
                assert_eq!(rec.start, LinearExpr::atom(ValueId(0)));
                assert_eq!(rec.step, LinearExpr::constant(4));
                assert_eq!(rec.loop_id, LoopId(0));
            }
            other => panic!("expected a recurrence, got {}", other),
        }
    }
}
