//! Helpers shared by the unit tests: temporary chains, funded wallets and a
//! recording transport for protocol handlers.

pub mod test_utils;

pub use test_utils::*;
