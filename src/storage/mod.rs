//! Data storage and persistence
//!
//! The unspent-output cache kept beside the chain, and the in-memory pools a
//! node holds while syncing and mining.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::{IndexedOutput, UTXOSet};
