use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::BigUint;
use std::ops::Shl;

/// Fixed difficulty: a valid header digest has at least this many leading zero bits.
pub const TARGET_BITS: u32 = 16;

const HASH_BITS: u32 = 256;
const MAX_NONCE: i64 = i64::MAX;

pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Vec<u8>,
    target: BigUint,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> Result<ProofOfWork<'a>> {
        let merkle_root = block.hash_transactions()?;
        Ok(ProofOfWork {
            block,
            merkle_root,
            target: Self::target(),
        })
    }

    /// `2^(256 - TARGET_BITS)`
    pub fn target() -> BigUint {
        BigUint::from(1u8).shl(HASH_BITS - TARGET_BITS)
    }

    /// Header pre-image: prev hash, Merkle root, then big-endian timestamp,
    /// difficulty and nonce.
    pub fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let pre_block_hash = self.block.get_pre_block_hash();
        let mut data_bytes =
            Vec::with_capacity(pre_block_hash.len() + self.merkle_root.len() + 3 * 8);
        data_bytes.extend(pre_block_hash);
        data_bytes.extend(&self.merkle_root);
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend(i64::from(TARGET_BITS).to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        hash_to_int(hash) < self.target
    }

    /// Searches nonces from zero upward until the header digest is below target.
    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        info!(
            "Mining block at height {} with {} transaction(s)",
            self.block.get_height(),
            self.block.get_transactions().len()
        );
        let mut nonce = 0;
        while nonce < MAX_NONCE {
            let hash = sha256_digest(self.prepare_data(nonce).as_slice());
            if self.meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }
        Err(BlockchainError::Mining(format!(
            "Nonce space exhausted for block at height {}",
            self.block.get_height()
        )))
    }

    /// Recomputes the digest for the stored nonce and checks it against the
    /// target and the stored hash.
    pub fn validate(block: &Block) -> bool {
        let pow = match ProofOfWork::new_proof_of_work(block) {
            Ok(pow) => pow,
            Err(_) => return false,
        };
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        pow.meets_target(&hash) && hash.as_slice() == block.get_hash()
    }
}

/// Big-endian integer value of a digest, as compared against the target.
pub fn hash_to_int(hash: &[u8]) -> BigUint {
    BigUint::from_bytes_be(hash)
}
