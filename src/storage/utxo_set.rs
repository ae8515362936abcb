use crate::core::{Block, Blockchain, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::{Batch, Transactional, Tree};
use std::collections::HashMap;

const UTXO_TREE: &str = "chainstate";
const UTXO_META_TREE: &str = "chainstate_meta";
const SYNCED_TIP_KEY: &str = "synced_tip";

/// An unspent output together with its position in the creating transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct IndexedOutput {
    index: usize,
    output: TXOutput,
}

impl IndexedOutput {
    pub fn new(index: usize, output: TXOutput) -> IndexedOutput {
        IndexedOutput { index, output }
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

/// Cache of unspent outputs derived from the chain, keyed by transaction id.
///
/// The cache records which ledger tip it reflects. It is only current after
/// `reindex` or after `update` for every block appended since; `is_stale`
/// reports when neither holds.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn utxo_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    fn meta_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_META_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO meta tree: {e}")))
    }

    /// Every cache entry in key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<IndexedOutput>)>> {
        let mut entries = vec![];
        for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            let outs: Vec<IndexedOutput> = deserialize(v.as_ref())?;
            entries.push((k.to_vec(), outs));
        }
        Ok(entries)
    }

    /// Collects outputs locked to `pub_key_hash` until their total reaches
    /// `amount`. Returns the total and the chosen output indices per hex txid.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0;

        for (txid, outs) in self.entries()? {
            for out in outs {
                if accumulated >= amount {
                    break;
                }
                if out.output.is_locked_with_key(pub_key_hash) {
                    accumulated += out.output.get_value();
                    unspent_outputs
                        .entry(HEXLOWER.encode(&txid))
                        .or_default()
                        .push(out.index);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        Ok(self
            .entries()?
            .into_iter()
            .flat_map(|(_, outs)| outs)
            .filter(|out| out.output.is_locked_with_key(pub_key_hash))
            .map(|out| out.output)
            .collect())
    }

    /// Whether output `vout` of transaction `txid` is still in the cache.
    pub fn is_unspent(&self, txid: &[u8], vout: i64) -> Result<bool> {
        let index = match usize::try_from(vout) {
            Ok(index) => index,
            Err(_) => return Ok(false),
        };
        match self.utxo_tree()?.get(txid)? {
            Some(bytes) => {
                let outs: Vec<IndexedOutput> = deserialize(bytes.as_ref())?;
                Ok(outs.iter().any(|out| out.index == index))
            }
            None => Ok(false),
        }
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Rebuilds the cache from a full walk of the chain as of the tip seen
    /// on entry. A failed walk leaves the cache and its marker untouched.
    pub fn reindex(&self) -> Result<()> {
        let tip = self.blockchain.get_tip_hash();
        let utxo_map = self.blockchain.find_utxo_from(&tip)?;

        let utxo_tree = self.utxo_tree()?;
        let meta_tree = self.meta_tree()?;

        let mut batch = Batch::default();
        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            batch.insert(txid, serialize(outs)?);
        }

        // no marker while the entries are being replaced
        meta_tree.remove(SYNCED_TIP_KEY)?;
        utxo_tree.apply_batch(batch)?;
        meta_tree.insert(SYNCED_TIP_KEY, tip.as_slice())?;
        info!(
            "Reindexed unspent outputs: {} transaction(s) at tip {}",
            utxo_map.len(),
            HEXLOWER.encode(&tip)
        );
        Ok(())
    }

    /// Applies one appended block: spent outputs leave the cache, the block's
    /// new outputs enter it. All writes commit together.
    pub fn update(&self, block: &Block) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;
        let meta_tree = self.meta_tree()?;

        (&utxo_tree, &meta_tree)
            .transaction(|(utxo_db, meta_db)| {
                for tx in block.get_transactions() {
                    if !tx.is_coinbase() {
                        for vin in tx.get_vin() {
                            let outs_bytes = utxo_db.get(vin.get_txid())?.ok_or_else(|| {
                                ConflictableTransactionError::Abort(BlockchainError::NotFound(
                                    format!(
                                        "Unspent outputs of {}",
                                        HEXLOWER.encode(vin.get_txid())
                                    ),
                                ))
                            })?;
                            let outs: Vec<IndexedOutput> = deserialize(outs_bytes.as_ref())
                                .map_err(ConflictableTransactionError::Abort)?;

                            let spent = vin.output_index();
                            let remaining: Vec<IndexedOutput> = outs
                                .into_iter()
                                .filter(|out| Some(out.index) != spent)
                                .collect();

                            if remaining.is_empty() {
                                utxo_db.remove(vin.get_txid())?;
                            } else {
                                let outs_bytes = serialize(&remaining)
                                    .map_err(ConflictableTransactionError::Abort)?;
                                utxo_db.insert(vin.get_txid(), outs_bytes)?;
                            }
                        }
                    }

                    let new_outputs: Vec<IndexedOutput> = tx
                        .get_vout()
                        .iter()
                        .enumerate()
                        .map(|(idx, out)| IndexedOutput::new(idx, out.clone()))
                        .collect();
                    let outs_bytes =
                        serialize(&new_outputs).map_err(ConflictableTransactionError::Abort)?;
                    utxo_db.insert(tx.get_id(), outs_bytes)?;
                }
                meta_db.insert(SYNCED_TIP_KEY, block.get_hash())?;
                Ok(())
            })
            .map_err(BlockchainError::from)
    }

    /// The tip the cache was last brought up to, if any.
    pub fn synced_tip(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .meta_tree()?
            .get(SYNCED_TIP_KEY)?
            .map(|tip| tip.to_vec()))
    }

    pub fn is_stale(&self) -> Result<bool> {
        let stale = self.synced_tip()?.as_deref() != Some(self.blockchain.get_tip_hash().as_slice());
        if stale {
            warn!("Unspent-output cache does not reflect the current tip");
        }
        Ok(stale)
    }
}
