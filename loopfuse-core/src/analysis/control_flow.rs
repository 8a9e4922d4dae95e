//! Control Flow Analysis
//!
//! This module provides traversal orders, reachability, dominators and
//! unreachable-block elimination over a `Function`'s CFG.
//!
//! # Memory Optimizations
//! - Visited sets use `BitVec<u32>` indexed by block id (instead of `HashSet<BlockId>`)
//! - Back-edge lists use `SmallVec` (most headers have a single latch)
//!
//! # Dominator Algorithm
//! Iterative data flow over reverse post-order (Cooper, Harvey, Kennedy):
//! - `idom(entry) = entry`
//! - for every other block, intersect the dominator chains of its processed predecessors
//! - repeat until no immediate dominator changes

use crate::ir::function::Function;
use crate::ir::instruction::BlockId;
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Control flow analyzer for traversals and cleanup.
pub struct ControlFlowAnalyzer;

impl ControlFlowAnalyzer {
    /// Blocks reachable from the entry, in reverse post-order.
    ///
    /// # Algorithm
    /// Iterative depth-first search with an explicit `(block, next successor)` stack,
    /// so deep CFGs cannot overflow the call stack.
    pub fn reverse_postorder(func: &Function) -> Vec<BlockId> {
        let bound: usize = func.block_id_bound();
        let mut visited: BitVec<u32> = bitvec![u32, Lsb0; 0; bound];
        let mut postorder: Vec<BlockId> = Vec::with_capacity(func.blocks.len());

        if !func.contains_block(func.entry) {
            return postorder;
        }

        let mut stack: Vec<(BlockId, SmallVec<[BlockId; 2]>, usize)> = Vec::new();
        visited.set(func.entry.0 as usize, true);
        stack.push((func.entry, func.successors(func.entry), 0usize));

        while let Some((block, succs, next)) = stack.last_mut() {
            if let Some(&succ) = succs.get(*next) {
                *next += 1;
                let idx: usize = succ.0 as usize;
                if idx < bound && !visited[idx] && func.contains_block(succ) {
                    visited.set(idx, true);
                    let succ_succs = func.successors(succ);
                    stack.push((succ, succ_succs, 0usize));
                }
            } else {
                postorder.push(*block);
                stack.pop();
            }
        }

        postorder.reverse();
        postorder
    }

    /// Reachability from the entry as a bit set indexed by block id.
    pub fn reachable(func: &Function) -> BitVec<u32> {
        let mut reachable: BitVec<u32> = bitvec![u32, Lsb0; 0; func.block_id_bound()];
        for block in Self::reverse_postorder(func) {
            reachable.set(block.0 as usize, true);
        }
        reachable
    }

    /// Remove every block that cannot be reached from the entry.
    ///
    /// Phi entries naming removed blocks are not touched here; callers run
    /// `Function::repair_phis` afterwards so the stale entries can be
    /// reassigned to the predecessors that replaced them.
    ///
    /// # Returns
    /// Ids of the removed blocks, in their former layout order.
    pub fn eliminate_unreachable_blocks(func: &mut Function) -> Vec<BlockId> {
        let reachable: BitVec<u32> = Self::reachable(func);
        let removed: Vec<BlockId> = func
            .blocks
            .iter()
            .filter(|block| !reachable[block.id.0 as usize])
            .map(|block| block.id)
            .collect();
        if !removed.is_empty() {
            log::debug!(
                "{}: removing {} unreachable block(s): {:?}",
                func.name,
                removed.len(),
                removed
            );
            func.remove_blocks(&removed);
        }
        removed
    }
}

/// Dominator tree over the reachable part of a CFG.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator of each reachable block (`entry` maps to itself).
    idom: HashMap<BlockId, BlockId>,
    /// Reverse post-order position of each reachable block.
    rpo_index: HashMap<BlockId, usize>,
    order: Vec<BlockId>,
    entry: BlockId,
}

impl DominatorTree {
    pub fn compute(func: &Function) -> Self {
        let order: Vec<BlockId> = ControlFlowAnalyzer::reverse_postorder(func);
        let rpo_index: HashMap<BlockId, usize> = order
            .iter()
            .enumerate()
            .map(|(index, block)| (*block, index))
            .collect();
        let preds = func.predecessor_map();

        let mut idom: HashMap<BlockId, BlockId> = HashMap::with_capacity(order.len());
        idom.insert(func.entry, func.entry);

        let mut changed: bool = true;
        while changed {
            changed = false;
            for &block in order.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in preds.get(&block).map(|p| p.as_slice()).unwrap_or(&[]) {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(&idom, &rpo_index, pred, current),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        Self {
            idom,
            rpo_index,
            order,
            entry: func.entry,
        }
    }

    fn intersect(
        idom: &HashMap<BlockId, BlockId>,
        rpo_index: &HashMap<BlockId, usize>,
        mut a: BlockId,
        mut b: BlockId,
    ) -> BlockId {
        while a != b {
            while rpo_index[&a] > rpo_index[&b] {
                a = idom[&a];
            }
            while rpo_index[&b] > rpo_index[&a] {
                b = idom[&b];
            }
        }
        a
    }

    /// Does `a` dominate `b`? Every block dominates itself; unreachable blocks are dominated by nothing.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.idom.contains_key(&b) {
            return false;
        }
        let mut current: BlockId = b;
        loop {
            if current == a {
                return true;
            }
            if current == self.entry {
                return false;
            }
            current = self.idom[&current];
        }
    }

    #[inline]
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        if block == self.entry {
            return None;
        }
        self.idom.get(&block).copied()
    }

    #[inline]
    pub fn rpo_index(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(&block).copied()
    }

    /// Reachable blocks in reverse post-order.
    #[inline]
    pub fn order(&self) -> &[BlockId] {
        &self.order
    }
}
