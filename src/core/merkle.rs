use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;

/// Binary Merkle tree over serialized transactions.
///
/// Leaves hash their raw bytes; a parent hashes the concatenation of its two
/// children. A level with an odd node count duplicates its last node. Order is
/// preserved exactly as given.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Vec<u8>,
}

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(left);
    data.extend_from_slice(right);
    sha256_digest(&data)
}

impl MerkleTree {
    pub fn new(data: &[Vec<u8>]) -> Result<MerkleTree> {
        if data.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot build a Merkle tree without transactions".to_string(),
            ));
        }

        let mut level: Vec<Vec<u8>> = data.iter().map(|d| sha256_digest(d)).collect();
        // a single leaf is paired with itself as well
        loop {
            if level.len() % 2 != 0 {
                if let Some(last) = level.last().cloned() {
                    level.push(last);
                }
            }

            level = level
                .chunks_exact(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();

            if level.len() == 1 {
                break;
            }
        }

        let root = level.pop().ok_or_else(|| {
            BlockchainError::InvalidBlock("Merkle tree construction produced no root".to_string())
        })?;
        Ok(MerkleTree { root })
    }

    pub fn root_hash(&self) -> &[u8] {
        self.root.as_slice()
    }

    pub fn calculate_merkle_root(data: &[Vec<u8>]) -> Result<Vec<u8>> {
        Ok(MerkleTree::new(data)?.root)
    }
}
