//! Program Analysis
//!
//! Analyses the fusion pass consumes. Everything here is a read-only query over
//! a `Function`; results go stale as soon as the function is mutated.

pub mod access;
pub mod control_flow;
pub mod loop_analysis;
pub mod scalar_evolution;
