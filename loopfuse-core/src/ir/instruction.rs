//! SSA Instructions
//!
//! This module defines the instruction set the loop fusion pass operates on.
//! The IR is a small SSA form: every value is defined exactly once, merges
//! happen through phi nodes at the top of a block, and each block ends in a
//! single terminator.
//!
//! # Memory Optimizations
//! - `BinaryOp`, `Predicate` and `Opcode` use `#[repr(u8)]`
//! - `Phi.incoming` uses `SmallVec<[(BlockId, Operand); 2]>` (most phis merge two edges)
//! - `Terminator::successors` returns `SmallVec<[BlockId; 2]>` (no terminator has more than two)
//! - Block and value identifiers are `u32` newtypes

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Basic block identifier (unique within a function, stable across mutation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

/// SSA value identifier (parameters, phi results and instruction results).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Instruction operand: an SSA value or an integer literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Value(ValueId),
    Const(i64),
}

impl Operand {
    #[inline]
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }

    #[inline]
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Operand::Const(c) => Some(*c),
            Operand::Value(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(value: ValueId) -> Self {
        Operand::Value(value)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Const(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// Integer binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    And = 5,
    Or = 6,
    Xor = 7,
    Shl = 8,
}

/// Comparison predicate (signed integer semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Predicate {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl Predicate {
    /// Predicate that holds exactly when `self` does not.
    pub fn inverse(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Ne,
            Predicate::Ne => Predicate::Eq,
            Predicate::Lt => Predicate::Ge,
            Predicate::Le => Predicate::Gt,
            Predicate::Gt => Predicate::Le,
            Predicate::Ge => Predicate::Lt,
        }
    }

    /// Predicate with the operands exchanged (`a < b` becomes `b > a`).
    pub fn swapped(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Eq,
            Predicate::Ne => Predicate::Ne,
            Predicate::Lt => Predicate::Gt,
            Predicate::Le => Predicate::Ge,
            Predicate::Gt => Predicate::Lt,
            Predicate::Ge => Predicate::Le,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Lt => "lt",
            Predicate::Le => "le",
            Predicate::Gt => "gt",
            Predicate::Ge => "ge",
        }
    }
}

/// Instruction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstKind {
    /// `result = lhs op rhs`
    Binary { op: BinaryOp, lhs: Operand, rhs: Operand },
    /// `result = lhs pred rhs` (boolean)
    Compare { pred: Predicate, lhs: Operand, rhs: Operand },
    /// Address arithmetic: `result = base + index * scale`
    ElementPtr { base: Operand, index: Operand, scale: i64 },
    /// `result = *ptr`
    Load { ptr: Operand },
    /// `*ptr = value`
    Store { ptr: Operand, value: Operand },
    /// Opaque call; its result is never analyzable.
    Call { callee: String, args: Vec<Operand> },
}

/// Flat opcode, used when only the instruction's shape matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Opcode {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    And = 5,
    Or = 6,
    Xor = 7,
    Shl = 8,
    Compare = 9,
    ElementPtr = 10,
    Load = 11,
    Store = 12,
    Call = 13,
}

/// A non-phi, non-terminator instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Defined value, `None` for stores.
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match &self.kind {
            InstKind::Binary { op, .. } => match op {
                BinaryOp::Add => Opcode::Add,
                BinaryOp::Sub => Opcode::Sub,
                BinaryOp::Mul => Opcode::Mul,
                BinaryOp::Div => Opcode::Div,
                BinaryOp::Rem => Opcode::Rem,
                BinaryOp::And => Opcode::And,
                BinaryOp::Or => Opcode::Or,
                BinaryOp::Xor => Opcode::Xor,
                BinaryOp::Shl => Opcode::Shl,
            },
            InstKind::Compare { .. } => Opcode::Compare,
            InstKind::ElementPtr { .. } => Opcode::ElementPtr,
            InstKind::Load { .. } => Opcode::Load,
            InstKind::Store { .. } => Opcode::Store,
            InstKind::Call { .. } => Opcode::Call,
        }
    }

    /// All operands read by this instruction, in source order.
    pub fn operands(&self) -> SmallVec<[Operand; 4]> {
        match &self.kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                SmallVec::from_slice(&[*lhs, *rhs])
            }
            InstKind::ElementPtr { base, index, .. } => SmallVec::from_slice(&[*base, *index]),
            InstKind::Load { ptr } => SmallVec::from_slice(&[*ptr]),
            InstKind::Store { ptr, value } => SmallVec::from_slice(&[*ptr, *value]),
            InstKind::Call { args, .. } => args.iter().copied().collect(),
        }
    }

    pub fn operands_mut(&mut self) -> SmallVec<[&mut Operand; 4]> {
        match &mut self.kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                let mut ops: SmallVec<[&mut Operand; 4]> = SmallVec::new();
                ops.push(lhs);
                ops.push(rhs);
                ops
            }
            InstKind::ElementPtr { base, index, .. } => {
                let mut ops: SmallVec<[&mut Operand; 4]> = SmallVec::new();
                ops.push(base);
                ops.push(index);
                ops
            }
            InstKind::Load { ptr } => {
                let mut ops: SmallVec<[&mut Operand; 4]> = SmallVec::new();
                ops.push(ptr);
                ops
            }
            InstKind::Store { ptr, value } => {
                let mut ops: SmallVec<[&mut Operand; 4]> = SmallVec::new();
                ops.push(ptr);
                ops.push(value);
                ops
            }
            InstKind::Call { args, .. } => args.iter_mut().collect(),
        }
    }

    /// Address operand of a load or store.
    #[inline]
    pub fn pointer_operand(&self) -> Option<Operand> {
        match &self.kind {
            InstKind::Load { ptr } | InstKind::Store { ptr, .. } => Some(*ptr),
            _ => None,
        }
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        matches!(self.kind, InstKind::Load { .. })
    }

    #[inline]
    pub fn is_store(&self) -> bool {
        matches!(self.kind, InstKind::Store { .. })
    }
}

/// Phi node: `result = phi [value, pred], ...`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phi {
    pub result: ValueId,
    pub incoming: SmallVec<[(BlockId, Operand); 2]>,
}

impl Phi {
    /// Incoming value along the edge from `pred`.
    pub fn incoming_for(&self, pred: BlockId) -> Option<Operand> {
        self.incoming
            .iter()
            .find(|(block, _)| *block == pred)
            .map(|(_, value)| *value)
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: Operand,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Return(Option<Operand>),
    Unreachable,
}

/// Terminator shape without its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TerminatorKind {
    Jump = 0,
    Branch = 1,
    Return = 2,
    Unreachable = 3,
}

impl Terminator {
    pub fn kind(&self) -> TerminatorKind {
        match self {
            Terminator::Jump(_) => TerminatorKind::Jump,
            Terminator::Branch { .. } => TerminatorKind::Branch,
            Terminator::Return(_) => TerminatorKind::Return,
            Terminator::Unreachable => TerminatorKind::Unreachable,
        }
    }

    /// Successor blocks, deduplicated, in edge order.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Jump(target) => SmallVec::from_slice(&[*target]),
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                if then_dest == else_dest {
                    SmallVec::from_slice(&[*then_dest])
                } else {
                    SmallVec::from_slice(&[*then_dest, *else_dest])
                }
            }
            Terminator::Return(_) | Terminator::Unreachable => SmallVec::new(),
        }
    }

    /// Redirect every edge to `old` so it targets `new`. Returns the number of edges changed.
    pub fn retarget(&mut self, old: BlockId, new: BlockId) -> usize {
        let mut changed: usize = 0;
        match self {
            Terminator::Jump(target) => {
                if *target == old {
                    *target = new;
                    changed += 1;
                }
            }
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                if *then_dest == old {
                    *then_dest = new;
                    changed += 1;
                }
                if *else_dest == old {
                    *else_dest = new;
                    changed += 1;
                }
            }
            Terminator::Return(_) | Terminator::Unreachable => {}
        }
        changed
    }

    pub fn operand(&self) -> Option<Operand> {
        match self {
            Terminator::Branch { cond, .. } => Some(*cond),
            Terminator::Return(value) => *value,
            Terminator::Jump(_) | Terminator::Unreachable => None,
        }
    }

    pub fn operand_mut(&mut self) -> Option<&mut Operand> {
        match self {
            Terminator::Branch { cond, .. } => Some(cond),
            Terminator::Return(value) => value.as_mut(),
            Terminator::Jump(_) | Terminator::Unreachable => None,
        }
    }
}
