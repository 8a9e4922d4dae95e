//! Test Utilities
//!
//! Builders for functions made of consecutive counted loops, plus assertion
//! helpers shared by the integration tests.
//!
//! Every loop is laid out as
//! ```text
//! <label>:        i = phi [start, pre], [next, <label>.latch]; c = cmp pred i, bound; branch c
//! <label>.body:   body instructions
//! <label>.latch:  next = add i, step; jump <label>
//! <label>.exit:   jump to the next loop header (or return)
//! ```
//!
//! Diamond bodies branch on `i < 5` into `<label>.then` (which holds the
//! access) and an empty `<label>.else`; both arms jump to the latch.

#![allow(dead_code)]

use loopfuse_core::analysis::loop_analysis::{LoopAnalyzer, LoopForest, LoopId};
use loopfuse_core::analysis::scalar_evolution::{Expr, ScalarEvolution};
use loopfuse_core::ir::builder::FunctionBuilder;
use loopfuse_core::ir::function::Function;
use loopfuse_core::ir::instruction::{BlockId, Operand, Predicate, ValueId};

/// What a loop body does with the arrays `x` and `y`.
#[derive(Debug, Clone, Copy)]
pub enum Body {
    /// `x[i + offset] = i`
    StoreIv { offset: i64 },
    /// `y[i] = x[i + offset]`
    LoadCopy { offset: i64 },
    /// `y[i] = *x[i]` (address loaded from memory)
    LoadIndirect,
    /// `y[i] = j` where `j` is the previous loop's induction variable
    UsePrevious,
    /// Straight jump to the latch.
    Empty,
    /// `if i < 5 { x[i + offset] = i }`
    DiamondStore { offset: i64 },
    /// `if i < 5 { y[i] = x[i + offset] }`
    DiamondCopy { offset: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct LoopDesc {
    pub label: &'static str,
    pub start: i64,
    pub predicate: Predicate,
    pub bound: Bound,
    pub step: i64,
    pub body: Body,
    /// Also emit `x[i] = i` in the latch, after the increment.
    pub store_in_latch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Const(i64),
    /// The function parameter `n`.
    N,
}

impl LoopDesc {
    /// `for (i = 0; i < bound; i++) body`
    pub fn counted(label: &'static str, bound: i64, body: Body) -> Self {
        Self {
            label,
            start: 0,
            predicate: Predicate::Lt,
            bound: Bound::Const(bound),
            step: 1,
            body,
            store_in_latch: false,
        }
    }

    /// `for (i = 0; i < n; i++) body`
    pub fn up_to_n(label: &'static str, body: Body) -> Self {
        Self {
            bound: Bound::N,
            ..Self::counted(label, 0, body)
        }
    }
}

/// Blocks of one generated loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopBlocks {
    pub header: BlockId,
    pub body: BlockId,
    pub latch: BlockId,
    pub exit: BlockId,
    pub iv: ValueId,
    /// `then` and `else` blocks of a diamond body.
    pub arms: Option<(BlockId, BlockId)>,
}

pub struct ChainBuilder {
    b: FunctionBuilder,
    pub x: ValueId,
    pub y: ValueId,
    pub n: ValueId,
    /// Block whose terminator still has to be connected to what comes next.
    pending: BlockId,
    pub loops: Vec<LoopBlocks>,
}

impl ChainBuilder {
    pub fn new(name: &str) -> Self {
        let mut b = FunctionBuilder::new(name);
        let x = b.param("x");
        let y = b.param("y");
        let n = b.param("n");
        let entry = b.create_block("entry");
        Self {
            b,
            x,
            y,
            n,
            pending: entry,
            loops: Vec::new(),
        }
    }

    /// Insert an empty block between the previous loop and the next one.
    pub fn gap(&mut self, label: &str) -> BlockId {
        let block = self.b.create_block(label);
        self.b.switch_to(self.pending);
        self.b.jump(block);
        self.pending = block;
        block
    }

    pub fn add_loop(&mut self, desc: LoopDesc) -> LoopBlocks {
        let pre = self.pending;
        let header = self.b.create_block(desc.label);
        let body = self.b.create_block(format!("{}.body", desc.label));
        let latch = self.b.create_block(format!("{}.latch", desc.label));
        let exit = self.b.create_block(format!("{}.exit", desc.label));

        self.b.switch_to(pre);
        self.b.jump(header);

        self.b.switch_to(header);
        let iv = self.b.phi(&[(pre, Operand::Const(desc.start))]);
        let bound = match desc.bound {
            Bound::Const(c) => Operand::Const(c),
            Bound::N => Operand::Value(self.n),
        };
        let cond = self.b.compare(desc.predicate, iv, bound);
        self.b.branch(cond, body, exit);

        self.b.switch_to(body);
        let arms = self.emit_body(desc, iv, latch);

        self.b.switch_to(latch);
        let next = self.b.add(iv, desc.step);
        if desc.store_in_latch {
            let p = self.b.element_ptr(self.x, iv, 4);
            self.b.store(p, iv);
        }
        self.b.jump(header);
        self.b.add_phi_incoming(iv, latch, next);

        self.pending = exit;
        let blocks = LoopBlocks {
            header,
            body,
            latch,
            exit,
            iv,
            arms,
        };
        self.loops.push(blocks);
        blocks
    }

    /// Emit the body starting in the current block and terminate it with jumps
    /// to `latch`. Returns the arms of a diamond body.
    fn emit_body(&mut self, desc: LoopDesc, iv: ValueId, latch: BlockId) -> Option<(BlockId, BlockId)> {
        let (arm_body, arms) = match desc.body {
            Body::DiamondStore { offset } => (Body::StoreIv { offset }, true),
            Body::DiamondCopy { offset } => (Body::LoadCopy { offset }, true),
            other => (other, false),
        };
        if !arms {
            self.emit_straight(arm_body, iv);
            self.b.jump(latch);
            return None;
        }

        let then_arm = self.b.create_block(format!("{}.then", desc.label));
        let else_arm = self.b.create_block(format!("{}.else", desc.label));
        let cond = self.b.compare(Predicate::Lt, iv, 5i64);
        self.b.branch(cond, then_arm, else_arm);

        self.b.switch_to(then_arm);
        self.emit_straight(arm_body, iv);
        self.b.jump(latch);

        self.b.switch_to(else_arm);
        self.b.jump(latch);
        Some((then_arm, else_arm))
    }

    fn emit_straight(&mut self, body: Body, iv: ValueId) {
        match body {
            Body::StoreIv { offset } => {
                let idx = self.index(iv, offset);
                let p = self.b.element_ptr(self.x, idx, 4);
                self.b.store(p, iv);
            }
            Body::LoadCopy { offset } => {
                let idx = self.index(iv, offset);
                let p = self.b.element_ptr(self.x, idx, 4);
                let v = self.b.load(p);
                let q = self.b.element_ptr(self.y, iv, 4);
                self.b.store(q, v);
            }
            Body::LoadIndirect => {
                let p = self.b.element_ptr(self.x, iv, 4);
                let addr = self.b.load(p);
                let v = self.b.load(addr);
                let q = self.b.element_ptr(self.y, iv, 4);
                self.b.store(q, v);
            }
            Body::UsePrevious => {
                let previous = self.loops.last().map(|lp| lp.iv).unwrap_or(self.n);
                let q = self.b.element_ptr(self.y, iv, 4);
                self.b.store(q, previous);
            }
            Body::Empty | Body::DiamondStore { .. } | Body::DiamondCopy { .. } => {}
        }
    }

    fn index(&mut self, iv: ValueId, offset: i64) -> Operand {
        if offset == 0 {
            Operand::Value(iv)
        } else {
            Operand::Value(self.b.add(iv, offset))
        }
    }

    /// Return from the last exit block.
    pub fn finish(mut self) -> (Function, Vec<LoopBlocks>) {
        self.b.switch_to(self.pending);
        self.b.ret(None);
        let func = self
            .b
            .finish()
            .unwrap_or_else(|e| panic!("fixture should verify: {}", e));
        (func, self.loops)
    }

    /// Return the last loop's final induction value through a phi in its exit block.
    pub fn finish_with_exit_phi(mut self) -> (Function, Vec<LoopBlocks>, ValueId) {
        let last = *self.loops.last().expect("at least one loop");
        self.b.switch_to(last.exit);
        let out = self.b.phi(&[(last.header, Operand::Value(last.iv))]);
        self.b.ret(Some(Operand::Value(out)));
        let func = self
            .b
            .finish()
            .unwrap_or_else(|e| panic!("fixture should verify: {}", e));
        (func, self.loops, out)
    }
}

/// Build a function from consecutive loops.
pub fn chain(name: &str, loops: &[LoopDesc]) -> (Function, Vec<LoopBlocks>) {
    let mut builder = ChainBuilder::new(name);
    for desc in loops {
        builder.add_loop(*desc);
    }
    builder.finish()
}

/// The scenario pair: `x[i] = i` for 0..10, then `y[i] = x[i]` for 0..10.
pub fn fusible_pair() -> (Function, Vec<LoopBlocks>) {
    chain(
        "fusible_pair",
        &[
            LoopDesc::counted("a", 10, Body::StoreIv { offset: 0 }),
            LoopDesc::counted("b", 10, Body::LoadCopy { offset: 0 }),
        ],
    )
}

pub fn analyze(func: &Function) -> LoopForest {
    LoopAnalyzer::analyze_loops(func)
}

pub fn trip_count(func: &Function, forest: &LoopForest, id: LoopId) -> Expr {
    ScalarEvolution::new(func, forest).trip_count(id)
}

/// Loop ids in discovery order.
pub fn loop_ids(func: &Function) -> (LoopForest, Vec<LoopId>) {
    let forest = analyze(func);
    let order = forest.discovery_order();
    (forest, order)
}

/// Assert that `from` branches or jumps to exactly `to`.
pub fn assert_flows_to(func: &Function, from: BlockId, to: BlockId) {
    let succs = func.successors(from);
    assert_eq!(
        succs.as_slice(),
        &[to],
        "{} should flow only into {}, found {:?}",
        func.label_of(from),
        func.label_of(to),
        succs
    );
}
