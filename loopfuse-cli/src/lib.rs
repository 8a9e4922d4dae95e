//! Command handlers for the `loopfuse` binary.

pub mod commands;
