//! Loop Fusion
//!
//! - **Legality**: decides whether an adjacent loop pair can be merged, with a reason
//! - **Transform**: performs the CFG surgery for a legal pair
//! - **Driver**: applies single-pair or greedy-chain fusion to a whole function
//!
//! # API Reference
//!
//! ```rust,no_run
//! use loopfuse_core::config::FusionConfig;
//! use loopfuse_core::optimizer::driver::LoopFusionPass;
//! # fn demo(func: &mut loopfuse_core::ir::function::Function) -> Result<(), loopfuse_core::error::FusionError> {
//! let pass = LoopFusionPass::new(FusionConfig::default());
//! let report = pass.run(func)?;
//! println!("modified: {}", report.modified);
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod legality;
pub mod transform;
