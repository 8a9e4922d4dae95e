//! Process-wide pass counters
//!
//! Observational only: the pass increments these, nothing in the algorithm reads
//! them. Counters start at zero when the process starts and are never reset.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

static FUNCTIONS_ANALYZED: AtomicUsize = AtomicUsize::new(0);
static PAIRS_ATTEMPTED: AtomicUsize = AtomicUsize::new(0);
static PAIRS_FUSED: AtomicUsize = AtomicUsize::new(0);
static PAIRS_REJECTED: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub functions_analyzed: usize,
    pub pairs_attempted: usize,
    pub pairs_fused: usize,
    pub pairs_rejected: usize,
}

#[inline]
pub fn record_function_analyzed() {
    FUNCTIONS_ANALYZED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_pair_attempted() {
    PAIRS_ATTEMPTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_pair_fused() {
    PAIRS_FUSED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_pair_rejected() {
    PAIRS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> FusionStats {
    FusionStats {
        functions_analyzed: FUNCTIONS_ANALYZED.load(Ordering::Relaxed),
        pairs_attempted: PAIRS_ATTEMPTED.load(Ordering::Relaxed),
        pairs_fused: PAIRS_FUSED.load(Ordering::Relaxed),
        pairs_rejected: PAIRS_REJECTED.load(Ordering::Relaxed),
    }
}
