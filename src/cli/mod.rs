//! Command-line interface
//!
//! Argument parsing for the `powchain` binary.

pub mod commands;

pub use commands::{Command, Opt};
