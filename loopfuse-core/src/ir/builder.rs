//! IR Builder
//!
//! Incremental construction of SSA functions. The builder hands out fresh
//! block and value ids, appends instructions to the current insertion block,
//! and verifies the result in `finish`.
//!
//! # Examples
//! ```rust
//! use loopfuse_core::ir::builder::FunctionBuilder;
//! use loopfuse_core::ir::instruction::Operand;
//!
//! let mut b = FunctionBuilder::new("ret_zero");
//! let entry = b.create_block("entry");
//! b.switch_to(entry);
//! b.ret(Some(Operand::Const(0)));
//! let func = b.finish().unwrap();
//! assert_eq!(func.blocks.len(), 1);
//! ```

use crate::error::FusionError;
use crate::ir::function::{BasicBlock, Function, Param};
use crate::ir::instruction::{
    BinaryOp, BlockId, InstKind, Instruction, Operand, Phi, Predicate, Terminator, ValueId,
};
use smallvec::SmallVec;

/// Builder for `Function`s.
///
/// # Panics
/// Instruction and terminator methods panic when no insertion block has been
/// selected with `switch_to`; that is a construction bug, not an input error.
pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    blocks: Vec<BasicBlock>,
    current: Option<BlockId>,
    next_value: u32,
    next_block: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            blocks: Vec::new(),
            current: None,
            next_value: 0u32,
            next_block: 0u32,
        }
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value = self.next_value.wrapping_add(1);
        id
    }

    pub fn param(&mut self, name: impl Into<String>) -> ValueId {
        let id = self.fresh_value();
        self.params.push(Param {
            id,
            name: name.into(),
        });
        id
    }

    /// Append a new, empty block to the layout. The first block created is the entry.
    pub fn create_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block = self.next_block.wrapping_add(1);
        self.blocks.push(BasicBlock::new(id, label));
        id
    }

    /// Set the insertion point.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    #[inline]
    pub fn current_block(&self) -> Option<BlockId> {
        self.current
    }

    fn current_mut(&mut self) -> &mut BasicBlock {
        let current = self
            .current
            .expect("FunctionBuilder: no insertion block selected");
        self.blocks
            .iter_mut()
            .find(|block| block.id == current)
            .expect("FunctionBuilder: insertion block does not exist")
    }

    fn push_value(&mut self, kind: InstKind) -> ValueId {
        let result = self.fresh_value();
        self.current_mut().instructions.push(Instruction {
            result: Some(result),
            kind,
        });
        result
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> ValueId {
        self.push_value(InstKind::Binary {
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        })
    }

    pub fn add(&mut self, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn compare(
        &mut self,
        pred: Predicate,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> ValueId {
        self.push_value(InstKind::Compare {
            pred,
            lhs: lhs.into(),
            rhs: rhs.into(),
        })
    }

    /// `base + index * scale`
    pub fn element_ptr(
        &mut self,
        base: impl Into<Operand>,
        index: impl Into<Operand>,
        scale: i64,
    ) -> ValueId {
        self.push_value(InstKind::ElementPtr {
            base: base.into(),
            index: index.into(),
            scale,
        })
    }

    pub fn load(&mut self, ptr: impl Into<Operand>) -> ValueId {
        self.push_value(InstKind::Load { ptr: ptr.into() })
    }

    pub fn store(&mut self, ptr: impl Into<Operand>, value: impl Into<Operand>) {
        let kind = InstKind::Store {
            ptr: ptr.into(),
            value: value.into(),
        };
        self.current_mut()
            .instructions
            .push(Instruction { result: None, kind });
    }

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<Operand>) -> ValueId {
        self.push_value(InstKind::Call {
            callee: callee.into(),
            args,
        })
    }

    /// Add a phi to the current block. Incoming edges may be added later with
    /// `add_phi_incoming` once the predecessor values exist.
    pub fn phi(&mut self, incoming: &[(BlockId, Operand)]) -> ValueId {
        let result = self.fresh_value();
        self.current_mut().phis.push(Phi {
            result,
            incoming: SmallVec::from_slice(incoming),
        });
        result
    }

    pub fn add_phi_incoming(&mut self, phi: ValueId, pred: BlockId, value: impl Into<Operand>) {
        let value = value.into();
        if let Some(node) = self
            .blocks
            .iter_mut()
            .flat_map(|block| block.phis.iter_mut())
            .find(|node| node.result == phi)
        {
            node.incoming.push((pred, value));
        }
    }

    pub fn jump(&mut self, target: BlockId) {
        self.current_mut().terminator = Terminator::Jump(target);
    }

    pub fn branch(&mut self, cond: impl Into<Operand>, then_dest: BlockId, else_dest: BlockId) {
        self.current_mut().terminator = Terminator::Branch {
            cond: cond.into(),
            then_dest,
            else_dest,
        };
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.current_mut().terminator = Terminator::Return(value);
    }

    /// Finish construction and verify the function.
    ///
    /// # Errors
    /// Returns `FusionError::Verification` if the function has no blocks or is malformed.
    pub fn finish(self) -> Result<Function, FusionError> {
        let entry = match self.blocks.first() {
            Some(block) => block.id,
            None => {
                return Err(FusionError::Verification {
                    function: self.name,
                    message: "function has no blocks".to_string(),
                })
            }
        };
        let func = Function {
            name: self.name,
            params: self.params,
            blocks: self.blocks,
            entry,
        };
        func.verify()?;
        Ok(func)
    }
}
