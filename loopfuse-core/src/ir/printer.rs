//! Textual IR dump
//!
//! Human-readable rendering used for before/after traces. The format is a
//! debugging aid only; nothing parses it back.

use crate::ir::function::{BasicBlock, Function};
use crate::ir::instruction::{InstKind, Instruction, Phi, Terminator};
use std::fmt;

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        match &self.kind {
            InstKind::Binary { op, lhs, rhs } => {
                write!(f, "{:?} {}, {}", op, lhs, rhs)
            }
            InstKind::Compare { pred, lhs, rhs } => {
                write!(f, "cmp {} {}, {}", pred.mnemonic(), lhs, rhs)
            }
            InstKind::ElementPtr { base, index, scale } => {
                write!(f, "elementptr {}, {} x {}", base, index, scale)
            }
            InstKind::Load { ptr } => write!(f, "load {}", ptr),
            InstKind::Store { ptr, value } => write!(f, "store {}, {}", value, ptr),
            InstKind::Call { callee, args } => {
                write!(f, "call @{}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Phi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = phi", self.result)?;
        for (i, (pred, value)) in self.incoming.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}[{}, {}]", sep, value, pred)?;
        }
        Ok(())
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jump {}", target),
            Terminator::Branch {
                cond,
                then_dest,
                else_dest,
            } => write!(f, "branch {}, {}, {}", cond, then_dest, else_dest),
            Terminator::Return(Some(value)) => write!(f, "ret {}", value),
            Terminator::Return(None) => write!(f, "ret"),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}):", self.id, self.label)?;
        for phi in self.phis.iter() {
            writeln!(f, "    {}", phi)?;
        }
        for inst in self.instructions.iter() {
            writeln!(f, "    {}", inst)?;
        }
        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", param.id, param.name)?;
        }
        writeln!(f, ") {{")?;
        for block in self.blocks.iter() {
            write!(f, "{}", block)?;
        }
        writeln!(f, "}}")
    }
}
