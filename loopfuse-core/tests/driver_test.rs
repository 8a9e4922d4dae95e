// Pass driver: policies, anchors and reports
mod utils;

use loopfuse_core::config::{AnchorStrategy, ChainPolicy, FusionConfig};
use loopfuse_core::error::FusionError;
use loopfuse_core::optimizer::driver::{AttemptOutcome, LoopFusionPass};
use loopfuse_core::optimizer::legality::IllegalReason;
use loopfuse_core::stats;
use utils::{analyze, chain, fusible_pair, Body, LoopDesc};

fn copy_loop(label: &'static str) -> LoopDesc {
    LoopDesc::counted(label, 10, Body::LoadCopy { offset: 0 })
}

fn producer(label: &'static str) -> LoopDesc {
    LoopDesc::counted(label, 10, Body::StoreIv { offset: 0 })
}

fn pass_with(policy: ChainPolicy, anchor: AnchorStrategy, max_chain: Option<usize>) -> LoopFusionPass {
    LoopFusionPass::new(FusionConfig {
        policy,
        anchor,
        max_chain,
        trace: false,
    })
}

#[test]
fn test_single_loop_is_left_alone() {
    let (mut func, _) = chain("single", &[producer("a")]);
    let original = func.clone();

    let report = LoopFusionPass::default().run(&mut func).unwrap();
    assert!(!report.modified);
    assert_eq!(report.loops_before, 1);
    assert_eq!(report.loops_after, 1);
    assert!(report.attempts.is_empty());
    assert_eq!(func, original);
}

#[test]
fn test_function_without_loops() {
    let (mut func, _) = chain("straight", &[]);
    let original = func.clone();

    let report = LoopFusionPass::default().run(&mut func).unwrap();
    assert!(!report.modified);
    assert_eq!(report.loops_before, 0);
    assert_eq!(func, original);
}

#[test]
fn test_pair_is_fused() {
    let (mut func, _) = fusible_pair();
    let report = LoopFusionPass::default().run(&mut func).unwrap();

    assert!(report.modified);
    assert_eq!(report.function, "fusible_pair");
    assert_eq!(report.loops_before, 2);
    assert_eq!(report.loops_after, 1);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].anchor, "a");
    assert_eq!(report.attempts[0].candidate, "b");
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Fused);
    assert_eq!(report.blocking_reason(), None);
    assert!(func.verify().is_ok());
}

#[test]
fn test_greedy_chain_fuses_every_loop() {
    let (mut func, _) = chain("triple", &[producer("a"), copy_loop("b"), copy_loop("c")]);
    let report = LoopFusionPass::default().run(&mut func).unwrap();

    assert!(report.modified);
    assert_eq!(report.loops_after, 1);
    let outcomes: Vec<_> = report.attempts.iter().map(|a| a.outcome.clone()).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Fused, AttemptOutcome::Fused]);
    assert!(report.attempts.iter().all(|a| a.anchor == "a"));
    assert_eq!(analyze(&func).discovery_order().len(), 1);
}

#[test]
fn test_chain_stops_at_first_illegal_pair() {
    let (mut func, blocks) = chain(
        "blocked",
        &[
            producer("a"),
            copy_loop("b"),
            LoopDesc::counted("c", 20, Body::LoadCopy { offset: 0 }),
            copy_loop("d"),
        ],
    );
    let report = LoopFusionPass::default().run(&mut func).unwrap();

    assert!(report.modified);
    assert_eq!(report.loops_before, 4);
    assert_eq!(report.loops_after, 3);
    let outcomes: Vec<_> = report.attempts.iter().map(|a| a.outcome.clone()).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Fused,
            AttemptOutcome::Rejected(IllegalReason::TripCountMismatch),
        ]
    );
    assert_eq!(report.attempts[1].candidate, "c");
    assert_eq!(report.blocking_reason(), Some(IllegalReason::TripCountMismatch));

    // Nothing past the blocking pair was touched.
    let forest = analyze(&func);
    let d = blocks[3];
    assert!(forest.loop_with_header(d.header).is_some());
    assert!(func.contains_block(d.latch));
}

#[test]
fn test_single_pair_policy_makes_one_attempt() {
    let (mut func, _) = chain("triple", &[producer("a"), copy_loop("b"), copy_loop("c")]);
    let pass = pass_with(ChainPolicy::SinglePair, AnchorStrategy::First, None);
    let report = pass.run(&mut func).unwrap();

    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Fused);
    assert_eq!(report.loops_after, 2);
}

#[test]
fn test_single_pair_rejection_leaves_function_unchanged() {
    let (mut func, _) = chain(
        "rejected",
        &[producer("a"), LoopDesc::counted("b", 20, Body::LoadCopy { offset: 0 })],
    );
    let original = func.clone();
    let pass = pass_with(ChainPolicy::SinglePair, AnchorStrategy::First, None);
    let report = pass.run(&mut func).unwrap();

    assert!(!report.modified);
    assert_eq!(report.loops_after, 2);
    assert_eq!(
        report.attempts[0].outcome,
        AttemptOutcome::Rejected(IllegalReason::TripCountMismatch)
    );
    assert_eq!(func, original);
}

#[test]
fn test_max_chain_caps_attempts() {
    let (mut func, _) = chain(
        "capped",
        &[producer("a"), copy_loop("b"), copy_loop("c"), copy_loop("d")],
    );
    let pass = pass_with(ChainPolicy::GreedyChain, AnchorStrategy::First, Some(2));
    let report = pass.run(&mut func).unwrap();

    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.loops_after, 2);
}

#[test]
fn test_header_anchor_selects_later_loop() {
    let (mut func, blocks) = chain(
        "anchored",
        &[
            producer("a"),
            LoopDesc::counted("b", 20, Body::StoreIv { offset: 0 }),
            LoopDesc::counted("c", 20, Body::LoadCopy { offset: 0 }),
        ],
    );
    let pass = pass_with(
        ChainPolicy::GreedyChain,
        AnchorStrategy::Header("b".to_string()),
        None,
    );
    let report = pass.run(&mut func).unwrap();

    assert!(report.modified);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].anchor, "b");
    assert_eq!(report.attempts[0].candidate, "c");
    assert_eq!(report.loops_after, 2);

    // The loop before the anchor is untouched.
    let forest = analyze(&func);
    assert!(forest.loop_with_header(blocks[0].header).is_some());
    assert!(forest.loop_with_header(blocks[2].header).is_none());
}

#[test]
fn test_anchor_on_last_loop_has_no_candidates() {
    let (mut func, _) = fusible_pair();
    let original = func.clone();
    let pass = pass_with(
        ChainPolicy::GreedyChain,
        AnchorStrategy::Header("b".to_string()),
        None,
    );
    let report = pass.run(&mut func).unwrap();

    assert!(!report.modified);
    assert!(report.attempts.is_empty());
    assert_eq!(func, original);
}

#[test]
fn test_unknown_anchor_label() {
    let (mut func, _) = fusible_pair();
    let pass = pass_with(
        ChainPolicy::GreedyChain,
        AnchorStrategy::Header("missing".to_string()),
        None,
    );
    let err = pass.run(&mut func).unwrap_err();
    assert!(matches!(err, FusionError::AnchorNotFound { ref label, .. } if label == "missing"));
}

#[test]
fn test_trace_records_before_and_after() {
    let (mut func, _) = fusible_pair();
    let original_text = func.to_string();
    let pass = LoopFusionPass::new(FusionConfig {
        trace: true,
        ..FusionConfig::default()
    });
    let report = pass.run(&mut func).unwrap();

    let trace = report.trace.expect("trace enabled");
    assert_eq!(trace.before, original_text);
    assert_eq!(trace.after, func.to_string());
    assert_ne!(trace.before, trace.after);
}

#[test]
fn test_trace_is_off_by_default() {
    let (mut func, _) = fusible_pair();
    let report = LoopFusionPass::default().run(&mut func).unwrap();
    assert!(report.trace.is_none());
}

#[test]
fn test_analyze_is_a_dry_run() {
    let (func, _) = chain(
        "dry",
        &[
            producer("a"),
            copy_loop("b"),
            LoopDesc::counted("c", 20, Body::LoadCopy { offset: 0 }),
        ],
    );
    let original = func.clone();
    let report = LoopFusionPass::default().analyze(&func).unwrap();

    assert!(!report.modified);
    assert_eq!(report.loops_before, 3);
    assert_eq!(report.loops_after, 3);
    let pairs: Vec<_> = report
        .attempts
        .iter()
        .map(|a| (a.anchor.as_str(), a.candidate.as_str(), a.outcome.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("a", "b", AttemptOutcome::Legal),
            (
                "b",
                "c",
                AttemptOutcome::Rejected(IllegalReason::TripCountMismatch)
            ),
        ]
    );
    assert_eq!(func, original);
}

#[test]
fn test_counters_advance() {
    let before = stats::snapshot();
    let (mut func, _) = chain(
        "counted",
        &[
            producer("a"),
            copy_loop("b"),
            LoopDesc::counted("c", 20, Body::LoadCopy { offset: 0 }),
        ],
    );
    LoopFusionPass::default().run(&mut func).unwrap();
    let after = stats::snapshot();

    // Other tests run concurrently and share the counters.
    assert!(after.functions_analyzed >= before.functions_analyzed + 1);
    assert!(after.pairs_attempted >= before.pairs_attempted + 2);
    assert!(after.pairs_fused >= before.pairs_fused + 1);
    assert!(after.pairs_rejected >= before.pairs_rejected + 1);
}

#[test]
fn test_report_serializes_to_json() {
    let (mut func, _) = chain(
        "json",
        &[
            producer("a"),
            copy_loop("b"),
            LoopDesc::counted("c", 20, Body::LoadCopy { offset: 0 }),
        ],
    );
    let report = LoopFusionPass::default().run(&mut func).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["function"], "json");
    assert_eq!(json["modified"], true);
    assert_eq!(json["attempts"][0]["outcome"]["status"], "fused");
    assert_eq!(json["attempts"][1]["outcome"]["status"], "rejected");
    assert_eq!(json["attempts"][1]["outcome"]["detail"], "trip-count-mismatch");
    assert!(json.get("trace").is_none());
}

#[test]
fn test_store_in_anchor_latch_blocks_fusion() {
    let busy_latch = LoopDesc {
        store_in_latch: true,
        ..LoopDesc::counted("a", 10, Body::Empty)
    };
    let (mut func, _) = chain("busy_latch", &[busy_latch, copy_loop("b")]);
    let original = func.clone();
    let report = LoopFusionPass::default().run(&mut func).unwrap();

    assert!(!report.modified);
    assert_eq!(report.blocking_reason(), Some(IllegalReason::UnsupportedShape));
    assert_eq!(func, original);
}
