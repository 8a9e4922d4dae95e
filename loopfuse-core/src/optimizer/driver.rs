//! Loop Fusion Driver
//!
//! The pass entry point. Discovers the innermost loops of a function in header
//! reverse post-order, picks an anchor, and tries to fuse the following loops
//! into it one by one.
//!
//! # Policies
//! - **single-pair**: one anchor/candidate attempt, whatever its outcome
//! - **greedy-chain**: keep fusing into the anchor until a pair is illegal, a
//!   transform aborts, the candidates run out, or `max_chain` attempts were made
//!
//! Each attempt checks legality on the current function, and only then mutates
//! it. A rejected or aborted pair leaves the function exactly as it was.

use crate::analysis::loop_analysis::{LoopAnalyzer, LoopForest, LoopId};
use crate::config::{AnchorStrategy, FusionConfig};
use crate::error::FusionError;
use crate::ir::function::Function;
use crate::optimizer::legality::{IllegalReason, LegalityChecker, Verdict};
use crate::optimizer::transform::FusionTransformer;
use crate::stats;
use serde::Serialize;

/// Result of one anchor/candidate attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// The candidate was fused into the anchor.
    Fused,
    /// Dry run only: the pair would be fused.
    Legal,
    Rejected(IllegalReason),
    /// The pair was legal but the transform failed; nothing was changed.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusionAttempt {
    /// Header label of the anchor loop.
    pub anchor: String,
    /// Header label of the candidate loop.
    pub candidate: String,
    pub outcome: AttemptOutcome,
}

/// Function text before and after the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusionTrace {
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusionReport {
    pub function: String,
    pub modified: bool,
    /// Innermost loops before and after the pass.
    pub loops_before: usize,
    pub loops_after: usize,
    pub attempts: Vec<FusionAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<FusionTrace>,
}

impl FusionReport {
    fn unchanged(func: &Function, loops: usize) -> Self {
        Self {
            function: func.name.clone(),
            modified: false,
            loops_before: loops,
            loops_after: loops,
            attempts: Vec::new(),
            trace: None,
        }
    }

    /// The reason the chain stopped, if a pair was rejected.
    pub fn blocking_reason(&self) -> Option<IllegalReason> {
        self.attempts.iter().find_map(|attempt| match attempt.outcome {
            AttemptOutcome::Rejected(reason) => Some(reason),
            _ => None,
        })
    }
}

/// Loop fusion pass.
#[derive(Debug, Clone, Default)]
pub struct LoopFusionPass {
    config: FusionConfig,
}

impl LoopFusionPass {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Run the pass on `func` under the configured policy.
    ///
    /// # Returns
    /// A report with the modified flag and one attempt per pair tried.
    ///
    /// # Errors
    /// `FusionError::AnchorNotFound` when a `header:<label>` anchor names no
    /// innermost loop. Illegal pairs and aborted transforms are reported in the
    /// attempts, not as errors.
    pub fn run(&self, func: &mut Function) -> Result<FusionReport, FusionError> {
        stats::record_function_analyzed();
        let before = self.config.trace.then(|| func.to_string());

        let mut forest: LoopForest = LoopAnalyzer::analyze_loops(func);
        let order: Vec<LoopId> = forest.discovery_order();
        let mut report = FusionReport::unchanged(func, order.len());

        if order.len() < 2 {
            log::info!(
                "{}: {} innermost loop(s), nothing to fuse",
                func.name,
                order.len()
            );
            report.trace = before.map(|before| FusionTrace {
                after: before.clone(),
                before,
            });
            return Ok(report);
        }

        let anchor_index: usize = Self::resolve_anchor(func, &forest, &order, &self.config.anchor)?;
        let anchor: LoopId = order[anchor_index];
        let anchor_label: String = Self::header_label(func, &forest, anchor);
        let limit: usize = self.config.attempt_limit();
        log::info!(
            "{}: anchor {} under {}, {} candidate(s)",
            func.name,
            anchor_label,
            self.config.policy,
            order.len() - anchor_index - 1
        );

        for &candidate in order.iter().skip(anchor_index + 1).take(limit) {
            stats::record_pair_attempted();
            let candidate_label = Self::header_label(func, &forest, candidate);

            let checked = LegalityChecker::new(func, &forest).check(anchor, candidate)?;
            let outcome = match checked.verdict {
                Verdict::Illegal(reason) => {
                    stats::record_pair_rejected();
                    AttemptOutcome::Rejected(reason)
                }
                Verdict::Legal => match FusionTransformer::fuse(func, &mut forest, &checked) {
                    Ok(_) => {
                        stats::record_pair_fused();
                        report.modified = true;
                        AttemptOutcome::Fused
                    }
                    Err(err) => {
                        log::warn!(
                            "{}: fusing {} into {} aborted: {}",
                            func.name,
                            candidate_label,
                            anchor_label,
                            err
                        );
                        AttemptOutcome::Aborted(err.to_string())
                    }
                },
            };

            let stop = outcome != AttemptOutcome::Fused;
            report.attempts.push(FusionAttempt {
                anchor: anchor_label.clone(),
                candidate: candidate_label,
                outcome,
            });
            if stop {
                break;
            }
        }

        report.loops_after = forest.discovery_order().len();
        report.trace = before.map(|before| FusionTrace {
            before,
            after: func.to_string(),
        });
        Ok(report)
    }

    /// Report the verdict of every consecutive pair from the anchor onwards without
    /// mutating `func`. Shows where a greedy chain would stop and why.
    pub fn analyze(&self, func: &Function) -> Result<FusionReport, FusionError> {
        stats::record_function_analyzed();
        let forest: LoopForest = LoopAnalyzer::analyze_loops(func);
        let order: Vec<LoopId> = forest.discovery_order();
        let mut report = FusionReport::unchanged(func, order.len());
        if order.len() < 2 {
            return Ok(report);
        }

        let anchor_index = Self::resolve_anchor(func, &forest, &order, &self.config.anchor)?;
        let checker = LegalityChecker::new(func, &forest);
        for pair in order[anchor_index..].windows(2) {
            let checked = checker.check(pair[0], pair[1])?;
            let outcome = match checked.verdict {
                Verdict::Legal => AttemptOutcome::Legal,
                Verdict::Illegal(reason) => AttemptOutcome::Rejected(reason),
            };
            report.attempts.push(FusionAttempt {
                anchor: Self::header_label(func, &forest, pair[0]),
                candidate: Self::header_label(func, &forest, pair[1]),
                outcome,
            });
        }
        Ok(report)
    }

    fn resolve_anchor(
        func: &Function,
        forest: &LoopForest,
        order: &[LoopId],
        strategy: &AnchorStrategy,
    ) -> Result<usize, FusionError> {
        match strategy {
            AnchorStrategy::First => Ok(0),
            AnchorStrategy::Header(label) => order
                .iter()
                .position(|id| {
                    forest
                        .get(*id)
                        .and_then(|lp| func.block(lp.header))
                        .map(|header| header.label == *label)
                        .unwrap_or(false)
                })
                .ok_or_else(|| FusionError::AnchorNotFound {
                    label: label.clone(),
                    suggestion: format!(
                        "use the header label of an innermost loop of `{}`, or `first`",
                        func.name
                    ),
                }),
        }
    }

    fn header_label(func: &Function, forest: &LoopForest, id: LoopId) -> String {
        forest
            .get(id)
            .map(|lp| func.label_of(lp.header))
            .unwrap_or_else(|| id.to_string())
    }
}
