//! Test utilities for ledger and protocol tests

use crate::core::{Block, Blockchain, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::{Message, Transport};
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use std::collections::HashSet;
use std::sync::Mutex;
use tempfile::TempDir;

/// A valid Base58Check address nobody in the tests holds keys for.
pub const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

/// Create a test blockchain with temporary storage
pub fn create_test_blockchain(genesis_address: &str) -> (Blockchain, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("test_blockchain");
    let blockchain = Blockchain::create_blockchain_with_path(genesis_address, &db_path).unwrap();
    (blockchain, temp_dir)
}

/// A wallet holding the genesis reward of a fresh chain with a built cache.
pub fn create_funded_chain() -> (Blockchain, UTXOSet, Wallet, TempDir) {
    let wallet = Wallet::new().unwrap();
    let (blockchain, dir) = create_test_blockchain(&wallet.get_address());
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex().unwrap();
    (blockchain, utxo_set, wallet, dir)
}

/// Mines `transactions` plus a coinbase for `miner_address` and updates the cache.
pub fn mine_and_update(
    utxo_set: &UTXOSet,
    transactions: &[Transaction],
    miner_address: &str,
) -> Result<Block> {
    let mut txs = transactions.to_vec();
    txs.push(Transaction::new_coinbase_tx(miner_address, None)?);
    let block = utxo_set.get_blockchain().mine_block(&txs)?;
    utxo_set.update(&block)?;
    Ok(block)
}

/// Checks linkage, heights and proof of work from tip to genesis.
pub fn validate_blockchain_integrity(blockchain: &Blockchain) -> bool {
    let blocks: Vec<Block> = blockchain.iterator().collect();
    for pair in blocks.windows(2) {
        if pair[0].get_pre_block_hash() != pair[1].get_hash()
            || pair[0].get_height() != pair[1].get_height() + 1
        {
            return false;
        }
    }
    blocks.iter().all(ProofOfWork::validate)
        && blocks.last().map_or(false, |genesis| genesis.is_genesis())
}

/// Records every outbound message instead of opening connections.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Message)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_for(&self, addr: &str) {
        self.unreachable.lock().unwrap().insert(addr.to_string());
    }
}

impl Transport for RecordingTransport {
    fn send(&self, addr: &str, data: &[u8]) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(addr) {
            return Err(BlockchainError::Network(format!("{addr} is unreachable")));
        }
        let message = Message::decode(data)?;
        self.sent.lock().unwrap().push((addr.to_string(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;
    use crate::wallet::hash_pub_key;

    #[test]
    fn test_funded_chain() {
        let (blockchain, utxo_set, wallet, _dir) = create_funded_chain();
        assert!(validate_blockchain_integrity(&blockchain));

        let balance: u64 = utxo_set
            .find_utxo(&hash_pub_key(wallet.get_public_key()))
            .unwrap()
            .iter()
            .map(|out| out.get_value())
            .sum();
        assert_eq!(balance, SUBSIDY);
    }

    #[test]
    fn test_recording_transport() {
        let transport = RecordingTransport::default();
        let message = Message::GetBlocks(crate::network::message::GetBlocks {
            addr_from: "127.0.0.1:3000".to_string(),
        });
        transport
            .send("127.0.0.1:3001", &message.encode().unwrap())
            .unwrap();
        transport.fail_for("127.0.0.1:3002");
        assert!(transport
            .send("127.0.0.1:3002", &message.encode().unwrap())
            .is_err());
        assert_eq!(transport.sent(), vec![("127.0.0.1:3001".to_string(), message)]);
    }
}
