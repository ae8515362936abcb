use crate::core::Transaction;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Transactions waiting to be mined, keyed by hex txid.
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(txid_hex)
            .cloned()
    }

    pub fn add(&self, tx: Transaction) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tx.get_id_hex(), tx);
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(txid_hex)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pool, ordered by txid so mining is deterministic.
    pub fn get_all(&self) -> Vec<Transaction> {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut txs: Vec<Transaction> = pool.values().cloned().collect();
        txs.sort_by(|a, b| a.get_id().cmp(b.get_id()));
        txs
    }
}

/// Block hashes advertised by a peer and not yet requested, oldest first.
pub struct BlockInTransit {
    inner: RwLock<Vec<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(vec![]),
        }
    }

    /// Appends hashes that are not already queued.
    pub fn add_blocks(&self, blocks: &[Vec<u8>]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for hash in blocks {
            if !inner.contains(hash) {
                inner.push(hash.clone());
            }
        }
    }

    pub fn first(&self) -> Option<Vec<u8>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn remove(&self, block_hash: &[u8]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = inner.iter().position(|x| x.eq(block_hash)) {
            inner.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
