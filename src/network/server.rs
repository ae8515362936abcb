use crate::core::{Block, Blockchain, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    Addr, BlockData, GetBlocks, GetData, Inv, Message, OpType, TxData, Version, NODE_VERSION,
};
use crate::network::{Nodes, Transport};
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::Read;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

const TCP_READ_TIMEOUT: u64 = 60;

/// Protocol state shared by every connection handler of one node.
pub struct NodeState {
    node_address: String,
    mining_address: Option<String>,
    nodes: Nodes,
    blocks_in_transit: BlockInTransit,
    memory_pool: MemoryPool,
    // serializes ledger writes with their cache maintenance: block receipt
    // and the whole drain-and-mine loop
    ledger: Mutex<()>,
}

impl NodeState {
    /// The hub is seeded as the first known peer.
    pub fn new(node_address: &str, hub_address: &str, mining_address: Option<String>) -> NodeState {
        let nodes = Nodes::new();
        nodes.add_node(hub_address.to_string());
        NodeState {
            node_address: node_address.to_string(),
            mining_address,
            nodes,
            blocks_in_transit: BlockInTransit::new(),
            memory_pool: MemoryPool::new(),
            ledger: Mutex::new(()),
        }
    }

    pub fn get_node_address(&self) -> &str {
        &self.node_address
    }

    pub fn get_mining_address(&self) -> Option<&str> {
        self.mining_address.as_deref()
    }

    pub fn is_miner(&self) -> bool {
        self.mining_address.is_some()
    }

    pub fn is_hub(&self) -> bool {
        self.nodes
            .first()
            .map_or(false, |hub| hub.get_addr() == self.node_address)
    }

    pub fn hub_address(&self) -> Option<String> {
        self.nodes.first().map(|hub| hub.get_addr())
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn blocks_in_transit(&self) -> &BlockInTransit {
        &self.blocks_in_transit
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }
}

/// A ledger node speaking the gossip protocol: one inbound message per
/// connection, each handled on its own thread.
#[derive(Clone)]
pub struct Server {
    blockchain: Blockchain,
    state: Arc<NodeState>,
    transport: Arc<dyn Transport>,
}

impl Server {
    pub fn new(blockchain: Blockchain, state: NodeState, transport: Arc<dyn Transport>) -> Server {
        Server {
            blockchain,
            state: Arc::new(state),
            transport,
        }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_state(&self) -> &NodeState {
        &self.state
    }

    pub fn run(&self) -> Result<()> {
        let addr = self.state.get_node_address();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        info!(
            "Node listening on {addr} (hub: {}, miner: {})",
            self.state.is_hub(),
            self.state.is_miner()
        );

        self.bootstrap()?;

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => error!("Error accepting connection: {e}"),
            }
        }
        Ok(())
    }

    /// Announces this node to the hub. The hub itself sends nothing.
    pub fn bootstrap(&self) -> Result<()> {
        if self.state.is_hub() {
            return Ok(());
        }
        if let Some(hub) = self.state.hub_address() {
            self.send_version(&hub)?;
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let mut request = vec![];
        stream.read_to_end(&mut request)?;
        let _ = stream.shutdown(Shutdown::Both);

        self.handle_bytes(&request)
    }

    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<()> {
        let message = Message::decode(bytes)?;
        self.handle_message(message)
    }

    pub fn handle_message(&self, message: Message) -> Result<()> {
        debug!(
            "Received {} from {}",
            message.command(),
            message.addr_from().unwrap_or("unknown")
        );
        match message {
            Message::Addr(payload) => self.handle_addr(payload),
            Message::Version(payload) => self.handle_version(payload),
            Message::GetBlocks(payload) => self.handle_get_blocks(payload),
            Message::Inv(payload) => self.handle_inv(payload),
            Message::GetData(payload) => self.handle_get_data(payload),
            Message::Block(payload) => self.handle_block(payload),
            Message::Tx(payload) => self.handle_tx(payload),
        }
    }

    fn handle_addr(&self, payload: Addr) -> Result<()> {
        for addr in payload.addr_list {
            if addr != self.state.node_address {
                self.state.nodes.add_node(addr);
            }
        }
        info!("There are {} known nodes", self.state.nodes.len());
        for addr in self.peers() {
            self.send_get_blocks(&addr)?;
        }
        Ok(())
    }

    fn handle_version(&self, payload: Version) -> Result<()> {
        let local_best_height = self.blockchain.get_best_height()?;
        let remote_best_height = payload.best_height;

        if local_best_height < remote_best_height {
            self.send_get_blocks(&payload.addr_from)?;
        } else if local_best_height > remote_best_height {
            self.send_version(&payload.addr_from)?;
        }

        if self.state.nodes.add_node(payload.addr_from.clone()) {
            info!("Discovered node {}", payload.addr_from);
            if self.state.is_hub() && self.state.nodes.len() > 2 {
                self.send_addr(&payload.addr_from)?;
            }
        }
        Ok(())
    }

    fn handle_get_blocks(&self, payload: GetBlocks) -> Result<()> {
        let blocks = self.blockchain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, OpType::Block, &blocks)
    }

    fn handle_inv(&self, payload: Inv) -> Result<()> {
        info!(
            "Received inventory with {} {:?} item(s) from {}",
            payload.items.len(),
            payload.op_type,
            payload.addr_from
        );
        match payload.op_type {
            OpType::Block => {
                let mut missing = vec![];
                for hash in payload.items {
                    if self.blockchain.get_block(&hash)?.is_none() {
                        missing.push(hash);
                    }
                }
                self.state.blocks_in_transit.add_blocks(&missing);
                if let Some(block_hash) = missing.first() {
                    self.send_get_data(&payload.addr_from, OpType::Block, block_hash)?;
                    self.state.blocks_in_transit.remove(block_hash);
                }
            }
            OpType::Tx => {
                for txid in &payload.items {
                    if !self.state.memory_pool.contains(&HEXLOWER.encode(txid)) {
                        self.send_get_data(&payload.addr_from, OpType::Tx, txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_get_data(&self, payload: GetData) -> Result<()> {
        let id_hex = HEXLOWER.encode(&payload.id);
        match payload.op_type {
            OpType::Block => match self.blockchain.get_block(&payload.id)? {
                Some(block) => self.send_block(&payload.addr_from, &block)?,
                None => warn!("Peer {} asked for unknown block {id_hex}", payload.addr_from),
            },
            OpType::Tx => match self.state.memory_pool.get(&id_hex) {
                Some(tx) => self.send_tx(&payload.addr_from, &tx)?,
                None => warn!(
                    "Peer {} asked for transaction {id_hex} not in the pool",
                    payload.addr_from
                ),
            },
        }
        Ok(())
    }

    fn handle_block(&self, payload: BlockData) -> Result<()> {
        let block = Block::deserialize(&payload.block)?;
        if !ProofOfWork::validate(&block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} from {} fails proof of work",
                block.get_hash_hex(),
                payload.addr_from
            )));
        }
        for tx in block.get_transactions() {
            if !tx.has_valid_id()? {
                return Err(BlockchainError::InvalidBlock(format!(
                    "Block {} from {} carries transaction {} under a forged id",
                    block.get_hash_hex(),
                    payload.addr_from,
                    tx.get_id_hex()
                )));
            }
        }

        let _ledger = self
            .state
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.blockchain.add_block(&block)?;
        info!(
            "Received block {} from {}",
            block.get_hash_hex(),
            payload.addr_from
        );
        for tx in block.get_transactions() {
            self.state.memory_pool.remove(&tx.get_id_hex());
        }

        match self.state.blocks_in_transit.first() {
            Some(block_hash) => {
                self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
                self.state.blocks_in_transit.remove(&block_hash);
            }
            None => UTXOSet::new(self.blockchain.clone()).reindex()?,
        }
        Ok(())
    }

    fn handle_tx(&self, payload: TxData) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        if !tx.has_valid_id()? {
            return Err(BlockchainError::Transaction(format!(
                "Transaction from {} does not hash to its id {}",
                payload.addr_from,
                tx.get_id_hex()
            )));
        }
        let txid = tx.get_id().to_vec();
        info!(
            "Received transaction {} from {}",
            tx.get_id_hex(),
            payload.addr_from
        );
        self.state.memory_pool.add(tx);

        if self.state.is_hub() {
            for addr in self.peers() {
                if addr != payload.addr_from {
                    self.send_inv(&addr, OpType::Tx, &[txid.clone()])?;
                }
            }
        } else if self.state.is_miner() {
            self.mine_pending()?;
        }
        Ok(())
    }

    /// Mines the pool into blocks until it is empty or holds nothing valid.
    fn mine_pending(&self) -> Result<()> {
        let mining_address = match self.state.get_mining_address() {
            Some(addr) => addr.to_string(),
            None => return Ok(()),
        };
        let _ledger = self
            .state
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let utxo_set = UTXOSet::new(self.blockchain.clone());

        loop {
            let candidates = self.state.memory_pool.get_all();
            if candidates.is_empty() {
                return Ok(());
            }
            // selection reads the cache, so it must reflect the tip
            if utxo_set.is_stale()? {
                utxo_set.reindex()?;
            }

            let txs = self.select_transactions(candidates, &utxo_set)?;
            if txs.is_empty() {
                info!("All pooled transactions are invalid, waiting for new ones");
                return Ok(());
            }

            let mut block_txs = txs;
            block_txs.push(Transaction::new_coinbase_tx(&mining_address, None)?);

            let new_block = match self.blockchain.mine_block(&block_txs) {
                Ok(block) => block,
                Err(BlockchainError::Mining(msg)) => {
                    warn!("{msg}; pooled transactions wait for the next round");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            utxo_set.update(&new_block)?;
            info!("New block {} is mined", new_block.get_hash_hex());

            for tx in &block_txs {
                self.state.memory_pool.remove(&tx.get_id_hex());
            }
            for addr in self.peers() {
                self.send_inv(&addr, OpType::Block, &[new_block.get_hash().to_vec()])?;
            }
        }
    }

    /// Keeps pooled transactions that verify and spend unspent outputs not
    /// already claimed by an earlier candidate. Rejected ones leave the pool.
    fn select_transactions(
        &self,
        candidates: Vec<Transaction>,
        utxo_set: &UTXOSet,
    ) -> Result<Vec<Transaction>> {
        let mut claimed: HashSet<(Vec<u8>, i64)> = HashSet::new();
        let mut selected = vec![];

        for tx in candidates {
            let valid = match self.blockchain.verify_transaction(&tx) {
                Ok(valid) => valid,
                Err(BlockchainError::NotFound(msg)) => {
                    warn!("Transaction {} references {msg}", tx.get_id_hex());
                    false
                }
                Err(e) => return Err(e),
            };

            let mut conflict = false;
            if valid {
                for vin in tx.get_vin() {
                    let outpoint = (vin.get_txid().to_vec(), vin.get_vout());
                    if claimed.contains(&outpoint)
                        || !utxo_set.is_unspent(vin.get_txid(), vin.get_vout())?
                    {
                        conflict = true;
                        break;
                    }
                }
            }

            if !valid || conflict {
                warn!(
                    "Dropping transaction {} from the pool ({})",
                    tx.get_id_hex(),
                    if valid { "spends unavailable output" } else { "invalid" }
                );
                self.state.memory_pool.remove(&tx.get_id_hex());
                continue;
            }

            for vin in tx.get_vin() {
                claimed.insert((vin.get_txid().to_vec(), vin.get_vout()));
            }
            selected.push(tx);
        }
        Ok(selected)
    }

    /// Known peers other than this node.
    fn peers(&self) -> Vec<String> {
        self.state
            .nodes
            .get_addresses()
            .into_iter()
            .filter(|addr| *addr != self.state.node_address)
            .collect()
    }

    /// Best effort: a peer that cannot be reached is evicted.
    fn send_message(&self, addr: &str, message: Message) -> Result<()> {
        let bytes = message.encode()?;
        if let Err(e) = self.transport.send(addr, &bytes) {
            warn!("{e}; evicting peer {addr}");
            self.state.nodes.evict_node(addr);
        }
        Ok(())
    }

    fn send_addr(&self, addr: &str) -> Result<()> {
        let addr_list = self.state.nodes.get_addresses();
        self.send_message(addr, Message::Addr(Addr { addr_list }))
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.blockchain.get_best_height()?;
        self.send_message(
            addr,
            Message::Version(Version {
                addr_from: self.state.node_address.clone(),
                version: NODE_VERSION,
                best_height,
            }),
        )
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        self.send_message(
            addr,
            Message::GetBlocks(GetBlocks {
                addr_from: self.state.node_address.clone(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        self.send_message(
            addr,
            Message::Inv(Inv {
                addr_from: self.state.node_address.clone(),
                op_type,
                items: items.to_vec(),
            }),
        )
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        self.send_message(
            addr,
            Message::GetData(GetData {
                addr_from: self.state.node_address.clone(),
                op_type,
                id: id.to_vec(),
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        self.send_message(
            addr,
            Message::Block(BlockData {
                addr_from: self.state.node_address.clone(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        self.send_message(
            addr,
            Message::Tx(TxData {
                addr_from: self.state.node_address.clone(),
                transaction: tx.serialize()?,
            }),
        )
    }
}

/// Hands a transaction to `addr` from outside a running node.
pub fn send_tx(transport: &dyn Transport, addr_from: &str, addr: &str, tx: &Transaction) -> Result<()> {
    let message = Message::Tx(TxData {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });
    transport.send(addr, &message.encode()?)
}
