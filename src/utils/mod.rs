//! Utility functions and helpers
//!
//! Hashing, Base58, ECDSA P-256 primitives and the bincode codec used for
//! every persisted or transmitted structure.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign,
    ecdsa_p256_sha256_sign_verify, new_key_pair, public_key_from_pkcs8, ripemd160_digest,
    sha256_digest,
};

pub use serialization::{deserialize, serialize};
