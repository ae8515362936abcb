use ring::digest::{Context, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING,
};
use ripemd::{Digest as RipemdDigest, Ripemd160};

use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width in bytes of a P-256 field element / scalar.
const P256_COORDINATE_LEN: usize = 32;
/// SEC1 tag for an uncompressed curve point.
const SEC1_UNCOMPRESSED_TAG: u8 = 0x04;

pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    if duration > i64::MAX as u128 {
        return Err(BlockchainError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn ripemd160_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| BlockchainError::InvalidAddress(format!("Invalid base58 encoding: {e}")))
}

/// Generates a fresh P-256 private key as a PKCS#8 document.
pub fn new_key_pair() -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to generate ECDSA key pair: {e}")))?
        .as_ref()
        .to_vec();
    Ok(pkcs8)
}

/// Returns the public key for a PKCS#8 private key as `X ‖ Y` (no SEC1 tag).
pub fn public_key_from_pkcs8(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let sec1 = key_pair.public_key().as_ref();
    match sec1.split_first() {
        Some((&SEC1_UNCOMPRESSED_TAG, xy)) => Ok(xy.to_vec()),
        _ => Err(BlockchainError::Crypto(
            "Unexpected public key encoding".to_string(),
        )),
    }
}

/// Signs `message` (hashed with SHA-256) and returns `r ‖ s`, 32 bytes each.
pub fn ecdsa_p256_sha256_sign(pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let signature = key_pair
        .sign(&rng, message)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to sign message: {e}")))?
        .as_ref()
        .to_vec();
    Ok(signature)
}

/// Verifies an `r ‖ s` signature against an `X ‖ Y` public key.
///
/// Both inputs are split in half and each half is left-padded to the curve
/// width, so short big-endian halves from other encoders are accepted.
pub fn ecdsa_p256_sha256_sign_verify(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let (x, y) = match split_halves(public_key) {
        Some(halves) => halves,
        None => return false,
    };
    let (r, s) = match split_halves(signature) {
        Some(halves) => halves,
        None => return false,
    };

    let mut point = Vec::with_capacity(1 + 2 * P256_COORDINATE_LEN);
    point.push(SEC1_UNCOMPRESSED_TAG);
    point.extend(x);
    point.extend(y);

    let mut fixed_signature = Vec::with_capacity(2 * P256_COORDINATE_LEN);
    fixed_signature.extend(r);
    fixed_signature.extend(s);

    let peer_public_key = ring::signature::UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point);
    peer_public_key
        .verify(message, fixed_signature.as_slice())
        .is_ok()
}

fn split_halves(bytes: &[u8]) -> Option<([u8; P256_COORDINATE_LEN], [u8; P256_COORDINATE_LEN])> {
    if bytes.is_empty() || bytes.len() % 2 != 0 || bytes.len() > 2 * P256_COORDINATE_LEN {
        return None;
    }
    let (left, right) = bytes.split_at(bytes.len() / 2);
    Some((left_pad(left), left_pad(right)))
}

fn left_pad(half: &[u8]) -> [u8; P256_COORDINATE_LEN] {
    let mut padded = [0u8; P256_COORDINATE_LEN];
    padded[P256_COORDINATE_LEN - half.len()..].copy_from_slice(half);
    padded
}
