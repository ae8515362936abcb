// The ledger: blocks live in a sled tree keyed by hash, and the tip hash sits
// under the sentinel key "l" in the same tree so both move together.

use crate::core::block::GENESIS_COINBASE_DATA;
use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::IndexedOutput;
use crate::wallet::Wallet;
use data_encoding::HEXLOWER;
use log::{error, info, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "l";
const BLOCKS_TREE: &str = "blocks";

#[derive(Clone)]
pub struct Blockchain {
    tip_hash: Arc<RwLock<Vec<u8>>>,
    db: Db,
    db_path: PathBuf,
}

impl Blockchain {
    /// Opens the database at `db_path`, writing a genesis block paying
    /// `genesis_address` when the store holds no chain yet.
    pub fn create_blockchain_with_path(genesis_address: &str, db_path: &Path) -> Result<Blockchain> {
        let db = sled::open(db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = db.open_tree(BLOCKS_TREE)?;

        let tip_hash = match blocks_tree.get(TIP_BLOCK_HASH_KEY)? {
            Some(data) => {
                info!("Blockchain already exists at {}", db_path.display());
                data.to_vec()
            }
            None => {
                info!("Creating genesis block for address: {genesis_address}");
                let coinbase_tx =
                    Transaction::new_coinbase_tx(genesis_address, Some(GENESIS_COINBASE_DATA))?;
                let block = Block::generate_genesis_block(&coinbase_tx)?;
                Self::update_blocks_tree(&blocks_tree, &block)?;
                block.get_hash().to_vec()
            }
        };

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            db,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Opens an existing chain; fails when the store has no tip.
    pub fn new_blockchain_with_path(db_path: &Path) -> Result<Blockchain> {
        let db = sled::open(db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = db.open_tree(BLOCKS_TREE)?;

        let tip_hash = blocks_tree.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::NotFound(format!(
                "No existing blockchain found at {}. Create one first.",
                db_path.display()
            ))
        })?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.to_vec())),
            db,
            db_path: db_path.to_path_buf(),
        })
    }

    fn update_blocks_tree(blocks_tree: &Tree, block: &Block) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        blocks_tree
            .transaction(|tx_db| {
                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to update blocks tree: {e}"))
            })?;

        Ok(())
    }

    fn blocks_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Verifies `transactions`, mines them into a block on top of the tip and
    /// persists block and tip together.
    ///
    /// The caller supplies any coinbase. Nothing is written when a transaction
    /// is invalid or two transactions spend the same output.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        for (i, transaction) in transactions.iter().enumerate() {
            if !self.verify_transaction(transaction)? {
                return Err(BlockchainError::Transaction(format!(
                    "Invalid transaction at index {i}: {}",
                    transaction.get_id_hex()
                )));
            }
        }
        Self::check_for_double_spending(transactions)?;

        let next_height = self.get_best_height()? + 1;
        let block = Block::new_block(self.get_tip_hash(), transactions, next_height)?;

        self.commit_block(&block, true)?;
        info!(
            "Appended block {} at height {next_height}",
            block.get_hash_hex()
        );

        Ok(block)
    }

    /// Stores `block` and moves the tip to it when it is strictly higher than
    /// the tip found in the store, in one sled transaction. Returns whether
    /// the tip moved.
    ///
    /// With `require_tip_move` nothing is written unless the tip moves, and a
    /// block overtaken while it was mined is a `Mining` error.
    fn commit_block(&self, block: &Block, require_tip_move: bool) -> Result<bool> {
        let blocks_tree = self.blocks_tree()?;
        let block_data = block.serialize()?;

        // held across the commit so the cached tip follows commit order
        let mut cached_tip = self
            .tip_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let tip_moved = blocks_tree
            .transaction(|tx_db| {
                let current_height = match tx_db.get(TIP_BLOCK_HASH_KEY)? {
                    Some(tip_hash) => {
                        let tip_bytes = tx_db.get(tip_hash)?.ok_or_else(|| {
                            ConflictableTransactionError::Abort(BlockchainError::NotFound(
                                "Tip block missing from store".to_string(),
                            ))
                        })?;
                        let tip_block = Block::deserialize(tip_bytes.as_ref())
                            .map_err(ConflictableTransactionError::Abort)?;
                        Some(tip_block.get_height())
                    }
                    None => None,
                };

                let higher = current_height.map_or(true, |height| block.get_height() > height);
                if !higher && require_tip_move {
                    return Err(ConflictableTransactionError::Abort(BlockchainError::Mining(
                        format!(
                            "Block {} at height {} was overtaken by a tip at height {}",
                            block.get_hash_hex(),
                            block.get_height(),
                            current_height.unwrap_or_default()
                        ),
                    )));
                }

                tx_db.insert(block.get_hash(), block_data.as_slice())?;
                if higher {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
                }
                Ok(higher)
            })
            .map_err(BlockchainError::from)?;

        if tip_moved {
            *cached_tip = block.get_hash().to_vec();
        }
        Ok(tip_moved)
    }

    fn check_for_double_spending(transactions: &[Transaction]) -> Result<()> {
        let mut spent_outputs: HashSet<(&[u8], i64)> = HashSet::new();

        for (tx_index, transaction) in transactions.iter().enumerate() {
            if transaction.is_coinbase() {
                continue;
            }
            for input in transaction.get_vin() {
                if !spent_outputs.insert((input.get_txid(), input.get_vout())) {
                    return Err(BlockchainError::Transaction(format!(
                        "Double spend in transaction {tx_index}: output {}:{} already spent in this block",
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stores a block received from a peer. The tip moves only when the block
    /// is strictly higher than the current tip; a lower or equal block is kept
    /// without reconciling its branch.
    pub fn add_block(&self, block: &Block) -> Result<()> {
        let blocks_tree = self.blocks_tree()?;
        if blocks_tree.contains_key(block.get_hash())? {
            return Ok(());
        }

        let tip_moved = self.commit_block(block, false)?;
        if tip_moved {
            info!(
                "Added block {} at height {}, new tip",
                block.get_hash_hex(),
                block.get_height()
            );
        } else {
            info!(
                "Stored block {} at height {} without moving the tip",
                block.get_hash_hex(),
                block.get_height()
            );
        }
        Ok(())
    }

    pub fn iterator(&self) -> BlockchainIterator {
        self.iterator_from(self.get_tip_hash())
    }

    /// Walks back from `tip_hash` instead of the current tip.
    pub fn iterator_from(&self, tip_hash: Vec<u8>) -> BlockchainIterator {
        BlockchainIterator::new(tip_hash, self.db.clone())
    }

    /// Unspent outputs of the whole chain, keyed by hex transaction id, each
    /// tagged with its index inside the transaction.
    pub fn find_utxo(&self) -> Result<HashMap<String, Vec<IndexedOutput>>> {
        self.find_utxo_from(&self.get_tip_hash())
    }

    /// Unspent outputs of the chain ending at `tip_hash`.
    pub fn find_utxo_from(&self, tip_hash: &[u8]) -> Result<HashMap<String, Vec<IndexedOutput>>> {
        let mut utxo: HashMap<String, Vec<IndexedOutput>> = HashMap::new();
        let mut spent_txos: HashMap<String, HashSet<i64>> = HashMap::new();

        let mut iterator = self.iterator_from(tip_hash.to_vec());
        while let Some(block) = iterator.try_next()? {
            // a block may spend outputs it also creates, so collect its spends first
            for tx in block.get_transactions() {
                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    spent_txos
                        .entry(HEXLOWER.encode(txin.get_txid()))
                        .or_default()
                        .insert(txin.get_vout());
                }
            }

            for tx in block.get_transactions() {
                let txid_hex = tx.get_id_hex();
                let spent = spent_txos.get(&txid_hex);
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    let is_spent = spent.map_or(false, |outs| {
                        i64::try_from(idx).map_or(false, |idx| outs.contains(&idx))
                    });
                    if !is_spent {
                        utxo.entry(txid_hex.clone())
                            .or_default()
                            .push(IndexedOutput::new(idx, out.clone()));
                    }
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        let mut iterator = self.iterator();
        while let Some(block) = iterator.try_next()? {
            if let Some(transaction) = block
                .get_transactions()
                .iter()
                .find(|transaction| txid.eq(transaction.get_id()))
            {
                return Ok(transaction.clone());
            }
        }
        Err(BlockchainError::NotFound(format!(
            "Transaction {}",
            HEXLOWER.encode(txid)
        )))
    }

    fn previous_transactions(&self, transaction: &Transaction) -> Result<HashMap<String, Transaction>> {
        let mut prev_txs = HashMap::new();
        for vin in transaction.get_vin() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            if prev_txs.contains_key(&txid_hex) {
                continue;
            }
            let prev_tx = self.find_transaction(vin.get_txid())?;
            prev_txs.insert(txid_hex, prev_tx);
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, transaction: &mut Transaction, wallet: &Wallet) -> Result<()> {
        let prev_txs = self.previous_transactions(transaction)?;
        transaction.sign(wallet.get_pkcs8(), &prev_txs)
    }

    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool> {
        if transaction.is_coinbase() {
            return transaction.verify(&HashMap::new());
        }
        let prev_txs = self.previous_transactions(transaction)?;
        let valid = transaction.verify(&prev_txs)?;
        if !valid {
            warn!(
                "Transaction {} failed signature verification",
                transaction.get_id_hex()
            );
        }
        Ok(valid)
    }

    pub fn get_best_height(&self) -> Result<usize> {
        let tip_hash = self.get_tip_hash();
        let tip_block = self.get_block(&tip_hash)?.ok_or_else(|| {
            BlockchainError::NotFound(format!("Tip block {}", HEXLOWER.encode(&tip_hash)))
        })?;
        Ok(tip_block.get_height())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks_tree()?.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Hashes of the active chain, tip first.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut iterator = self.iterator();
        let mut blocks = vec![];
        while let Some(block) = iterator.try_next()? {
            blocks.push(block.get_hash().to_vec());
        }
        Ok(blocks)
    }
}

/// Walks the chain from a tip back to genesis.
pub struct BlockchainIterator {
    db: Db,
    current_hash: Vec<u8>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip_hash,
            db,
        }
    }

    /// Next block toward genesis, or `None` once genesis has been returned.
    pub fn try_next(&mut self) -> Result<Option<Block>> {
        if self.current_hash.is_empty() {
            return Ok(None);
        }
        let block_tree = self.db.open_tree(BLOCKS_TREE)?;
        let data = block_tree.get(&self.current_hash)?.ok_or_else(|| {
            BlockchainError::NotFound(format!(
                "Block {} referenced by the chain",
                HEXLOWER.encode(&self.current_hash)
            ))
        })?;
        let block = Block::deserialize(data.as_ref())?;
        self.current_hash = block.get_pre_block_hash().to_vec();
        Ok(Some(block))
    }
}

impl Iterator for BlockchainIterator {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(block) => block,
            Err(e) => {
                error!("Chain traversal stopped: {e}");
                self.current_hash.clear();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::{create_test_blockchain, TEST_ADDRESS};
    use tempfile::tempdir;

    #[test]
    fn test_create_blockchain_writes_genesis() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        assert_eq!(blockchain.get_best_height().unwrap(), 0);

        let blocks: Vec<Block> = blockchain.iterator().collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert_eq!(blocks[0].get_hash(), blockchain.get_tip_hash().as_slice());
    }

    #[test]
    fn test_open_missing_chain_fails() {
        let dir = tempdir().unwrap();
        let result = Blockchain::new_blockchain_with_path(&dir.path().join("empty"));
        assert!(matches!(result, Err(BlockchainError::NotFound(_))));
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let tip = {
            let chain = Blockchain::create_blockchain_with_path(TEST_ADDRESS, &path).unwrap();
            chain.get_tip_hash()
        };
        let reopened = Blockchain::create_blockchain_with_path(TEST_ADDRESS, &path).unwrap();
        assert_eq!(reopened.get_tip_hash(), tip);
    }

    #[test]
    fn test_mine_block_extends_tip() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let genesis_hash = blockchain.get_tip_hash();

        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        let block = blockchain.mine_block(&[coinbase]).unwrap();

        assert_eq!(block.get_height(), 1);
        assert_eq!(block.get_pre_block_hash(), genesis_hash.as_slice());
        assert_eq!(blockchain.get_tip_hash(), block.get_hash());
        assert_eq!(blockchain.get_block_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_find_transaction() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let genesis = blockchain.iterator().next().unwrap();
        let coinbase = &genesis.get_transactions()[0];

        let found = blockchain.find_transaction(coinbase.get_id()).unwrap();
        assert_eq!(&found, coinbase);
        assert!(matches!(
            blockchain.find_transaction(&[0u8; 32]),
            Err(BlockchainError::NotFound(_))
        ));
    }

    #[test]
    fn test_double_spend_within_block_rejected() {
        let wallet = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&wallet.get_address(), None).unwrap();
        let spend = |vout| {
            Transaction::new(
                vec![crate::core::TXInput::with_key(
                    funding.get_id(),
                    vout,
                    wallet.get_public_key(),
                )],
                vec![crate::core::TXOutput::new(10, TEST_ADDRESS).unwrap()],
            )
            .unwrap()
        };
        let result = Blockchain::check_for_double_spending(&[spend(0), spend(0)]);
        assert!(matches!(result, Err(BlockchainError::Transaction(_))));
        assert!(Blockchain::check_for_double_spending(&[spend(0)]).is_ok());
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        let block = Block::new_block(blockchain.get_tip_hash(), &[coinbase], 1).unwrap();

        blockchain.add_block(&block).unwrap();
        blockchain.add_block(&block).unwrap();

        assert_eq!(blockchain.get_tip_hash(), block.get_hash());
        assert_eq!(blockchain.get_block_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_overtaken_mined_block_is_not_committed() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let genesis_hash = blockchain.get_tip_hash();
        let mined = Block::new_block(
            genesis_hash.clone(),
            &[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()],
            1,
        )
        .unwrap();

        // a height-1 block from a peer lands first
        let received = Block::new_block(
            genesis_hash,
            &[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()],
            1,
        )
        .unwrap();
        blockchain.add_block(&received).unwrap();

        assert!(matches!(
            blockchain.commit_block(&mined, true),
            Err(BlockchainError::Mining(_))
        ));
        assert_eq!(blockchain.get_tip_hash(), received.get_hash());
        assert!(blockchain.get_block(mined.get_hash()).unwrap().is_none());
    }

    #[test]
    fn test_mining_never_lowers_a_received_tip() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let mut branch = vec![];
        let mut prev = blockchain.get_tip_hash();
        for height in 1..=3 {
            let block = Block::new_block(
                prev,
                &[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()],
                height,
            )
            .unwrap();
            prev = block.get_hash().to_vec();
            branch.push(block);
        }

        let miner = {
            let blockchain = blockchain.clone();
            std::thread::spawn(move || {
                let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
                blockchain.mine_block(&[coinbase])
            })
        };
        for block in &branch {
            blockchain.add_block(block).unwrap();
        }
        let mined = miner.join().unwrap();

        if let Err(e) = &mined {
            assert!(matches!(e, BlockchainError::Mining(_)), "{e}");
        }
        let tip = blockchain.get_tip_hash();
        assert!(blockchain.get_best_height().unwrap() >= 3);
        assert!(
            tip == branch[2].get_hash()
                || mined.as_ref().map_or(false, |block| block.get_hash() == tip.as_slice())
        );
        let stored_tip = blockchain
            .get_db()
            .open_tree(BLOCKS_TREE)
            .unwrap()
            .get(TIP_BLOCK_HASH_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored_tip.as_ref(), tip.as_slice());
    }

    #[test]
    fn test_find_utxo_from_older_tip() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let genesis_hash = blockchain.get_tip_hash();
        blockchain
            .mine_block(&[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()])
            .unwrap();

        assert_eq!(blockchain.find_utxo().unwrap().len(), 2);
        assert_eq!(blockchain.find_utxo_from(&genesis_hash).unwrap().len(), 1);
    }

    #[test]
    fn test_coinbase_with_forged_id_is_rejected() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        let mut bytes = coinbase.serialize().unwrap();
        // byte 0 is the id's length prefix
        bytes[1] ^= 0x01;
        let forged = Transaction::deserialize(&bytes).unwrap();

        assert!(!blockchain.verify_transaction(&forged).unwrap());
        assert!(matches!(
            blockchain.mine_block(&[forged]),
            Err(BlockchainError::Transaction(_))
        ));
    }

    #[test]
    fn test_add_lower_block_keeps_tip() {
        let (blockchain, _dir) = create_test_blockchain(TEST_ADDRESS);
        let genesis_hash = blockchain.get_tip_hash();
        let tip = blockchain
            .mine_block(&[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()])
            .unwrap();

        let sibling = Block::new_block(
            genesis_hash,
            &[Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap()],
            1,
        )
        .unwrap();
        blockchain.add_block(&sibling).unwrap();

        assert_eq!(blockchain.get_tip_hash(), tip.get_hash());
        assert_eq!(
            blockchain.get_block(sibling.get_hash()).unwrap(),
            Some(sibling)
        );
    }
}
