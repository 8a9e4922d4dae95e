//! Functions and Basic Blocks
//!
//! A `Function` owns its blocks in layout order. Successor edges are read from
//! each block's terminator and predecessor edges are derived on demand, so a
//! retargeted terminator is immediately reflected everywhere.
//!
//! The mutation primitives here are the only way the optimizer edits a CFG:
//! - `retarget_edge`: redirect one CFG edge
//! - `move_block_after` / `remove_blocks`: layout and deletion
//! - `replace_all_uses`: SSA use rewriting
//! - `rewrite_phi_incoming` / `repair_phis`: phi incoming-list maintenance
//!
//! `verify` is run on every staged transformation before it is committed.

use crate::error::FusionError;
use crate::ir::instruction::{BlockId, Instruction, Operand, Phi, Terminator, ValueId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

/// Function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub id: ValueId,
    pub name: String,
}

/// Basic block: phis, straight-line instructions, one terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Human-readable label, used to name loops in reports.
    pub label: String,
    #[serde(default)]
    pub phis: Vec<Phi>,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(id: BlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    #[inline]
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        self.terminator.successors()
    }

    /// Every SSA value read anywhere in the block (phi incomings included).
    pub fn used_values(&self) -> Vec<ValueId> {
        let mut used: Vec<ValueId> = Vec::new();
        for phi in self.phis.iter() {
            used.extend(phi.incoming.iter().filter_map(|(_, value)| value.as_value()));
        }
        for inst in self.instructions.iter() {
            used.extend(inst.operands().iter().filter_map(|op| op.as_value()));
        }
        if let Some(op) = self.terminator.operand() {
            used.extend(op.as_value());
        }
        used
    }

    /// Values defined by the block's phis and instructions.
    pub fn defined_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.phis
            .iter()
            .map(|phi| phi.result)
            .chain(self.instructions.iter().filter_map(|inst| inst.result))
    }
}

/// Where an SSA value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefSite {
    Param,
    Phi { block: BlockId, index: usize },
    Instruction { block: BlockId, index: usize },
}

impl DefSite {
    /// Defining block, `None` for parameters.
    #[inline]
    pub fn block(&self) -> Option<BlockId> {
        match self {
            DefSite::Param => None,
            DefSite::Phi { block, .. } | DefSite::Instruction { block, .. } => Some(*block),
        }
    }
}

/// Function in SSA form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Blocks in layout order.
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
}

impl Function {
    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|block| block.id == id)
    }

    #[inline]
    pub fn contains_block(&self, id: BlockId) -> bool {
        self.blocks.iter().any(|block| block.id == id)
    }

    pub fn block_by_label(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.label == label)
    }

    /// Label of a block, or its numeric id when the block is gone.
    pub fn label_of(&self, id: BlockId) -> String {
        self.block(id)
            .map(|block| block.label.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// One past the largest block id (sizing for bit sets indexed by block id).
    pub fn block_id_bound(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.id.0 as usize + 1)
            .max()
            .unwrap_or(0)
    }

    fn missing_block(&self, block: BlockId) -> FusionError {
        FusionError::MissingBlock {
            function: self.name.clone(),
            block,
        }
    }

    pub fn successors(&self, id: BlockId) -> SmallVec<[BlockId; 2]> {
        self.block(id).map(BasicBlock::successors).unwrap_or_default()
    }

    /// Predecessors of `id` in layout order.
    pub fn predecessors(&self, id: BlockId) -> SmallVec<[BlockId; 2]> {
        self.blocks
            .iter()
            .filter(|block| block.successors().contains(&id))
            .map(|block| block.id)
            .collect()
    }

    /// Predecessor lists for every block, computed in one pass.
    pub fn predecessor_map(&self) -> HashMap<BlockId, SmallVec<[BlockId; 2]>> {
        let mut preds: HashMap<BlockId, SmallVec<[BlockId; 2]>> = HashMap::new();
        for block in self.blocks.iter() {
            preds.entry(block.id).or_default();
        }
        for block in self.blocks.iter() {
            for succ in block.successors() {
                let entry = preds.entry(succ).or_default();
                if !entry.contains(&block.id) {
                    entry.push(block.id);
                }
            }
        }
        preds
    }

    /// Definition site of every value in the function.
    pub fn definitions(&self) -> HashMap<ValueId, DefSite> {
        let mut defs: HashMap<ValueId, DefSite> = HashMap::new();
        for param in self.params.iter() {
            defs.insert(param.id, DefSite::Param);
        }
        for block in self.blocks.iter() {
            for (index, phi) in block.phis.iter().enumerate() {
                defs.insert(phi.result, DefSite::Phi { block: block.id, index });
            }
            for (index, inst) in block.instructions.iter().enumerate() {
                if let Some(result) = inst.result {
                    defs.insert(result, DefSite::Instruction { block: block.id, index });
                }
            }
        }
        defs
    }

    /// Instruction defining `value`, if it is an instruction result.
    pub fn defining_instruction(&self, value: ValueId) -> Option<&Instruction> {
        self.blocks
            .iter()
            .flat_map(|block| block.instructions.iter())
            .find(|inst| inst.result == Some(value))
    }

    /// Number of reads of `value` across the whole function.
    pub fn use_count(&self, value: ValueId) -> usize {
        self.blocks
            .iter()
            .map(|block| block.used_values().iter().filter(|v| **v == value).count())
            .sum()
    }

    /// Redirect the edge `from -> old_to` so it targets `new_to`.
    pub fn retarget_edge(
        &mut self,
        from: BlockId,
        old_to: BlockId,
        new_to: BlockId,
    ) -> Result<(), FusionError> {
        if !self.contains_block(new_to) {
            return Err(self.missing_block(new_to));
        }
        let missing = self.missing_block(from);
        let block = self.block_mut(from).ok_or(missing)?;
        if block.terminator.retarget(old_to, new_to) == 0 {
            return Err(FusionError::MissingEdge { from, to: old_to });
        }
        log::debug!("retargeted edge {} -> {} to {}", from, old_to, new_to);
        Ok(())
    }

    /// Move `block` so it directly follows `after` in the layout.
    pub fn move_block_after(&mut self, block: BlockId, after: BlockId) -> Result<(), FusionError> {
        if block == after {
            return Ok(());
        }
        let from: usize = self
            .blocks
            .iter()
            .position(|b| b.id == block)
            .ok_or_else(|| self.missing_block(block))?;
        let moved: BasicBlock = self.blocks.remove(from);
        match self.blocks.iter().position(|b| b.id == after) {
            Some(anchor) => {
                self.blocks.insert(anchor + 1, moved);
                Ok(())
            }
            None => {
                // Restore the layout before reporting.
                self.blocks.insert(from, moved);
                Err(self.missing_block(after))
            }
        }
    }

    /// Delete the given blocks. Phi entries naming them are left for `repair_phis`.
    pub fn remove_blocks(&mut self, removed: &[BlockId]) {
        self.blocks.retain(|block| !removed.contains(&block.id));
    }

    /// Rewrite every read of `old` into `new`. Returns the number of operands changed.
    pub fn replace_all_uses(&mut self, old: ValueId, new: Operand) -> usize {
        let mut replaced: usize = 0;
        let target: Operand = Operand::Value(old);
        for block in self.blocks.iter_mut() {
            for phi in block.phis.iter_mut() {
                for (_, value) in phi.incoming.iter_mut() {
                    if *value == target {
                        *value = new;
                        replaced += 1;
                    }
                }
            }
            for inst in block.instructions.iter_mut() {
                for op in inst.operands_mut() {
                    if *op == target {
                        *op = new;
                        replaced += 1;
                    }
                }
            }
            if let Some(op) = block.terminator.operand_mut() {
                if *op == target {
                    *op = new;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    /// Rename the predecessor of every phi entry in `block` that names `old_pred`.
    pub fn rewrite_phi_incoming(
        &mut self,
        block: BlockId,
        old_pred: BlockId,
        new_pred: BlockId,
    ) -> Result<usize, FusionError> {
        let missing = self.missing_block(block);
        let target = self.block_mut(block).ok_or(missing)?;
        let mut rewritten: usize = 0;
        for phi in target.phis.iter_mut() {
            for (pred, _) in phi.incoming.iter_mut() {
                if *pred == old_pred {
                    *pred = new_pred;
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }

    /// Bring every phi's incoming list back in line with the block's current predecessors.
    ///
    /// # Algorithm
    /// For each phi, entries naming a block that is no longer a predecessor are stale,
    /// predecessors without an entry are fresh:
    /// - no fresh predecessors: stale entries are dropped
    /// - all stale entries carry the same value: that value is given to every fresh predecessor
    /// - otherwise the repair is ambiguous and an error is returned
    ///
    /// # Returns
    /// Number of phis that were changed.
    pub fn repair_phis(&mut self) -> Result<usize, FusionError> {
        let preds: HashMap<BlockId, SmallVec<[BlockId; 2]>> = self.predecessor_map();
        let mut repaired: usize = 0;

        for block in self.blocks.iter_mut() {
            let current: SmallVec<[BlockId; 2]> = preds.get(&block.id).cloned().unwrap_or_default();
            for phi in block.phis.iter_mut() {
                let stale_values: Vec<Operand> = phi
                    .incoming
                    .iter()
                    .filter(|(pred, _)| !current.contains(pred))
                    .map(|(_, value)| *value)
                    .collect();
                if stale_values.is_empty() {
                    continue;
                }
                let fresh: SmallVec<[BlockId; 2]> = current
                    .iter()
                    .filter(|pred| phi.incoming.iter().all(|(known, _)| known != *pred))
                    .copied()
                    .collect();

                let value: Option<Operand> = if fresh.is_empty() {
                    None
                } else if stale_values.iter().all(|v| *v == stale_values[0]) {
                    Some(stale_values[0])
                } else {
                    return Err(FusionError::PhiRepair {
                        block: block.id,
                        phi: phi.result,
                    });
                };

                phi.incoming.retain(|(pred, _)| current.contains(pred));
                if let Some(value) = value {
                    for pred in fresh {
                        phi.incoming.push((pred, value));
                    }
                }
                repaired += 1;
            }
        }

        Ok(repaired)
    }

    /// Structural verification.
    ///
    /// # Checks
    /// - the entry block exists and block ids are unique
    /// - every terminator target exists
    /// - every phi has exactly one entry per predecessor
    /// - every value read is defined somewhere in the function
    pub fn verify(&self) -> Result<(), FusionError> {
        let fail = |message: String| FusionError::Verification {
            function: self.name.clone(),
            message,
        };

        if !self.contains_block(self.entry) {
            return Err(fail(format!("entry block {} does not exist", self.entry)));
        }

        let mut seen: HashSet<BlockId> = HashSet::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            if !seen.insert(block.id) {
                return Err(fail(format!("duplicate block id {}", block.id)));
            }
        }

        for block in self.blocks.iter() {
            for succ in block.successors() {
                if !seen.contains(&succ) {
                    return Err(fail(format!("{} branches to missing block {}", block.id, succ)));
                }
            }
        }

        let preds = self.predecessor_map();
        for block in self.blocks.iter() {
            let current = preds.get(&block.id).cloned().unwrap_or_default();
            for phi in block.phis.iter() {
                let named: HashSet<BlockId> = phi.incoming.iter().map(|(pred, _)| *pred).collect();
                let expected: HashSet<BlockId> = current.iter().copied().collect();
                if named.len() != phi.incoming.len() || named != expected {
                    return Err(fail(format!(
                        "phi {} in {} does not match predecessors {:?}",
                        phi.result, block.id, current
                    )));
                }
            }
        }

        let defs = self.definitions();
        for block in self.blocks.iter() {
            for value in block.used_values() {
                if !defs.contains_key(&value) {
                    return Err(fail(format!("{} reads undefined value {}", block.id, value)));
                }
            }
        }

        Ok(())
    }
}
