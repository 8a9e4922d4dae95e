//! Error Handling
//!
//! Error types for the fusion pass using `thiserror`.
//!
//! # Error Categories
//! - **Structural errors**: missing blocks or edges, failed phi repair, verification failures
//! - **Loop errors**: malformed loop views, unknown loop ids
//! - **Driver errors**: anchors that do not name a loop header, bad policy strings
//!
//! A pair that is merely not fusible is *not* an error: the legality checker
//! reports it as `Verdict::Illegal`. `FusionError::NotLegal` exists only for
//! callers that invoke the transformer directly with an illegal candidate.

use crate::analysis::loop_analysis::LoopId;
use crate::ir::instruction::{BlockId, ValueId};
use crate::optimizer::legality::IllegalReason;
use thiserror::Error;

/// Fusion pass error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// A block id did not resolve to a block of the function.
    #[error("block {block} does not exist in function `{function}`")]
    MissingBlock { function: String, block: BlockId },

    /// A loop id did not resolve to a loop of the forest.
    #[error("loop {loop_id} is not part of the loop forest")]
    MissingLoop { loop_id: LoopId },

    /// Edge retargeting found no edge to redirect.
    #[error("no edge {from} -> {to} to retarget")]
    MissingEdge { from: BlockId, to: BlockId },

    /// A loop view lacks the structure an operation requires.
    #[error("loop {loop_id} is malformed: {message}\nSuggestion: {suggestion}")]
    MalformedLoop {
        loop_id: LoopId,
        message: String,
        suggestion: String,
    },

    /// Stale phi entries disagreed on the value to give a new predecessor.
    #[error("cannot repair phi {phi} in {block}: removed predecessors carried different values")]
    PhiRepair { block: BlockId, phi: ValueId },

    /// Structural verification failed.
    #[error("verification of `{function}` failed: {message}")]
    Verification { function: String, message: String },

    /// The transformer was handed a candidate the checker rejected.
    #[error("loops {first} and {second} cannot be fused: {reason}")]
    NotLegal {
        first: LoopId,
        second: LoopId,
        reason: IllegalReason,
    },

    /// `header:<label>` anchor strategy did not match any loop header.
    #[error("no loop header is labelled `{label}`\nSuggestion: {suggestion}")]
    AnchorNotFound { label: String, suggestion: String },

    /// Anchor strategy string could not be parsed.
    #[error("invalid anchor strategy `{0}` (expected `first` or `header:<label>`)")]
    InvalidAnchor(String),

    /// Chain policy string could not be parsed.
    #[error("invalid chain policy `{0}` (expected `single-pair` or `greedy-chain`)")]
    InvalidPolicy(String),
}

impl FusionError {
    /// Malformed loop error with the usual suggestion.
    #[cold]
    pub fn malformed(loop_id: LoopId, message: impl Into<String>) -> Self {
        Self::MalformedLoop {
            loop_id,
            message: message.into(),
            suggestion: "re-run loop analysis on the current function".to_string(),
        }
    }
}
