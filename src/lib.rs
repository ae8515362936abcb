//! # powchain
//!
//! A minimal proof-of-work ledger node. It keeps a hash-linked chain of
//! blocks in sled, derives a cache of unspent outputs from it, mines blocks
//! by nonce search and gossips blocks and transactions with a few peers.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle root, proof-of-work, the chain
//! - `storage/`: the unspent-output cache, mempool and download queue
//! - `network/`: wire messages, transport and the per-node protocol handlers
//! - `wallet/`: P-256 key pairs, addresses and the wallet file
//! - `config/`: TOML and environment configuration
//! - `utils/`: hashing, signing and bincode helpers
//! - `cli/`: command-line parsing for the binary
//!
//! ## Known limitations
//! - The tip only moves to a strictly higher block; a competing branch of
//!   equal height is stored but never adopted, and nothing is rolled back.
//! - Difficulty is fixed at [`core::TARGET_BITS`].

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{Block, Blockchain, ProofOfWork, TXInput, TXOutput, Transaction};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Message, NodeState, Nodes, OpType, Server, TcpTransport, Transport};
pub use storage::{BlockInTransit, IndexedOutput, MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_pub_key, pub_key_hash_from_address, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
