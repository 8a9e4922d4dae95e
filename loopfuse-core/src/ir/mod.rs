//! Intermediate Representation
//!
//! The SSA IR the loop fusion pass analyzes and rewrites: instructions and
//! operands, functions and blocks with their mutation primitives, a builder,
//! and a textual printer for traces.

pub mod builder;
pub mod function;
pub mod instruction;
pub mod printer;
