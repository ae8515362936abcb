//! Key pairs and addresses
//!
//! P-256 key pairs, Base58Check address derivation and the per-node wallet
//! file.

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    convert_address, hash_pub_key, pub_key_hash_from_address, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
pub use wallets::{wallet_file_path, Wallets, WALLET_FILE_PREFIX};
