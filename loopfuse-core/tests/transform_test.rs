// CFG surgery for legal loop pairs
mod utils;

use loopfuse_core::analysis::scalar_evolution::Expr;
use loopfuse_core::error::FusionError;
use loopfuse_core::ir::instruction::{InstKind, Operand};
use loopfuse_core::optimizer::legality::{IllegalReason, LegalityChecker, Verdict};
use loopfuse_core::optimizer::transform::FusionTransformer;
use utils::{assert_flows_to, chain, fusible_pair, loop_ids, trip_count, Body, ChainBuilder, LoopDesc};

#[test]
fn test_fuse_pair_into_single_loop() {
    let (mut func, blocks) = fusible_pair();
    let (a, b) = (blocks[0], blocks[1]);
    let (mut forest, order) = loop_ids(&func);
    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();

    let record = FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();
    assert_eq!(record.anchor, order[0]);
    assert_eq!(record.fused, order[1]);
    // The block between the loops, B's header and B's latch.
    assert_eq!(record.removed_blocks, vec![a.exit, b.header, b.latch]);
    assert!(func.verify().is_ok());

    // A's body runs first, then B's, then the shared latch.
    assert_flows_to(&func, a.body, b.body);
    assert_flows_to(&func, b.body, a.latch);
    assert_flows_to(&func, a.latch, a.header);
    assert!(func.successors(a.header).contains(&b.exit));

    // Layout follows execution order.
    let layout: Vec<_> = func.blocks.iter().map(|block| block.id).collect();
    assert_eq!(layout, vec![func.entry, a.header, a.body, b.body, a.latch, b.exit]);
}

#[test]
fn test_fused_loop_keeps_trip_count() {
    let (mut func, _) = fusible_pair();
    let (mut forest, order) = loop_ids(&func);
    let before = trip_count(&func, &forest, order[0]);
    assert_eq!(before, Expr::constant(10));

    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();
    FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();

    // Fresh analysis of the rewritten function.
    let (fresh, fresh_order) = loop_ids(&func);
    assert_eq!(fresh_order.len(), 1);
    assert_eq!(trip_count(&func, &fresh, fresh_order[0]), before);

    // The updated forest agrees with the fresh one.
    assert_eq!(forest.discovery_order(), vec![order[0]]);
    let merged = forest.get(order[0]).unwrap();
    let rediscovered = fresh.get(fresh_order[0]).unwrap();
    assert_eq!(merged.blocks, rediscovered.blocks);
    assert_eq!(merged.exits, rediscovered.exits);
}

#[test]
fn test_second_induction_variable_is_replaced() {
    let (mut func, blocks) = fusible_pair();
    let (a, b) = (blocks[0], blocks[1]);
    let (mut forest, order) = loop_ids(&func);
    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();
    FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();

    assert_eq!(func.use_count(b.iv), 0);
    let body = func.block(b.body).unwrap();
    let indexes: Vec<Operand> = body
        .instructions
        .iter()
        .filter_map(|inst| match inst.kind {
            InstKind::ElementPtr { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(indexes, vec![Operand::Value(a.iv), Operand::Value(a.iv)]);
}

#[test]
fn test_exit_phi_is_repaired() {
    let mut builder = ChainBuilder::new("exit_phi");
    builder.add_loop(LoopDesc::counted("a", 10, Body::StoreIv { offset: 0 }));
    builder.add_loop(LoopDesc::counted("b", 10, Body::LoadCopy { offset: 0 }));
    let (mut func, blocks, out) = builder.finish_with_exit_phi();
    let (a, b) = (blocks[0], blocks[1]);

    let (mut forest, order) = loop_ids(&func);
    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();
    FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();

    let exit = func.block(b.exit).unwrap();
    let phi = exit.phis.iter().find(|phi| phi.result == out).unwrap();
    assert_eq!(phi.incoming.as_slice(), &[(a.header, Operand::Value(a.iv))]);
}

#[test]
fn test_empty_second_body() {
    let (mut func, blocks) = chain(
        "empty_body",
        &[
            LoopDesc::counted("a", 10, Body::StoreIv { offset: 0 }),
            LoopDesc::counted("b", 10, Body::Empty),
        ],
    );
    let (a, b) = (blocks[0], blocks[1]);
    let (mut forest, order) = loop_ids(&func);
    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();
    assert_eq!(candidate.verdict, Verdict::Legal);
    FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();

    assert_flows_to(&func, a.body, b.body);
    assert_flows_to(&func, b.body, a.latch);
    assert_eq!(loop_ids(&func).1.len(), 1);
}

#[test]
fn test_illegal_candidate_is_refused() {
    let (mut func, _) = chain(
        "mismatch",
        &[
            LoopDesc::counted("a", 10, Body::StoreIv { offset: 0 }),
            LoopDesc::counted("b", 20, Body::LoadCopy { offset: 0 }),
        ],
    );
    let original = func.clone();
    let (mut forest, order) = loop_ids(&func);
    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();

    let err = FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap_err();
    assert_eq!(
        err,
        FusionError::NotLegal {
            first: order[0],
            second: order[1],
            reason: IllegalReason::TripCountMismatch,
        }
    );
    assert_eq!(func, original);
    assert_eq!(forest.discovery_order(), order);
}

#[test]
fn test_fuse_diamond_bodies() {
    let (mut func, blocks) = chain(
        "diamonds",
        &[
            LoopDesc::counted("a", 10, Body::DiamondStore { offset: 0 }),
            LoopDesc::counted("b", 10, Body::DiamondCopy { offset: 0 }),
        ],
    );
    let (a, b) = (blocks[0], blocks[1]);
    let (a_then, a_else) = a.arms.unwrap();
    let (b_then, b_else) = b.arms.unwrap();
    let (mut forest, order) = loop_ids(&func);
    let b_last_body = forest.get(order[1]).unwrap().body().last().unwrap();
    assert!(b_last_body == b_then || b_last_body == b_else);

    let candidate = LegalityChecker::new(&func, &forest)
        .check(order[0], order[1])
        .unwrap();
    assert_eq!(candidate.verdict, Verdict::Legal);
    let record = FusionTransformer::fuse(&mut func, &mut forest, &candidate).unwrap();
    assert_eq!(record.removed_blocks, vec![a.exit, b.header, b.latch]);
    assert!(func.verify().is_ok());

    // Both arms of A enter B's body; both arms of B reach the shared latch.
    assert_flows_to(&func, a_then, b.body);
    assert_flows_to(&func, a_else, b.body);
    assert_flows_to(&func, b_then, a.latch);
    assert_flows_to(&func, b_else, a.latch);
    assert_flows_to(&func, a.latch, a.header);
    let mut latch_preds = func.predecessors(a.latch).to_vec();
    latch_preds.sort();
    let mut expected = vec![b_then, b_else];
    expected.sort();
    assert_eq!(latch_preds, expected);

    // The latch is laid out right after B's last body block.
    let position = |id| func.blocks.iter().position(|block| block.id == id).unwrap();
    assert_eq!(position(a.latch), position(b_last_body) + 1);

    let (fresh, fresh_order) = loop_ids(&func);
    assert_eq!(fresh_order.len(), 1);
    assert_eq!(trip_count(&func, &fresh, fresh_order[0]), Expr::constant(10));
    let merged = forest.get(order[0]).unwrap();
    assert_eq!(merged.blocks, fresh.get(fresh_order[0]).unwrap().blocks);
}
