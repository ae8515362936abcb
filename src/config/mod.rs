//! Configuration management
//!
//! Node id, listen and hub addresses, data directory and mining address,
//! read from an optional `powchain.toml` with environment overrides.

pub mod settings;

pub use settings::{Config, DEFAULT_CONFIG_FILE};
