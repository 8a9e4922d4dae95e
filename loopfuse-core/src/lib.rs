//! Loop fusion for a small SSA IR.
//!
//! The crate discovers natural loops, reasons about their trip counts and
//! memory accesses symbolically, and merges control-flow-adjacent loops
//! when doing so cannot change program behaviour.
//!
//! - [`ir`]: functions, blocks, instructions and the CFG mutation primitives
//! - [`analysis`]: control flow, loop discovery, scalar evolution, access extraction
//! - [`optimizer`]: legality checking, the fusion transform and the chain driver
//! - [`config`] / [`stats`]: pass configuration and process-wide counters

pub mod analysis;
pub mod config;
pub mod error;
pub mod ir;
pub mod optimizer;
pub mod stats;

pub use config::{AnchorStrategy, ChainPolicy, FusionConfig};
pub use error::FusionError;
pub use optimizer::driver::{FusionReport, LoopFusionPass};
