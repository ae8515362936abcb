// Entry point for the powchain CLI: every subcommand opens the node's own
// chain and wallet file as named by the configuration.
use clap::Parser;
use log::{error, info, LevelFilter};
use powchain::{
    convert_address, hash_pub_key, pub_key_hash_from_address, send_tx, validate_address,
    Blockchain, BlockchainError, Command, Config, NodeState, Opt, Server, TcpTransport,
    Transaction, UTXOSet, Wallets,
};
use std::process;
use std::sync::Arc;

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> powchain::Result<()> {
    let mut config = Config::load(&opt.config)?;

    match opt.command {
        Command::Createblockchain { address } => {
            if !validate_address(&address) {
                return Err(BlockchainError::InvalidAddress(address));
            }
            let blockchain =
                Blockchain::create_blockchain_with_path(&address, &config.blockchain_path())?;
            // the cache starts out empty, so build it right away
            UTXOSet::new(blockchain).reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(&config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let pub_key_hash = pub_key_hash_from_address(&address)?;
            let blockchain = Blockchain::new_blockchain_with_path(&config.blockchain_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            if utxo_set.is_stale()? {
                utxo_set.reindex()?;
            }
            let balance: u64 = utxo_set
                .find_utxo(&pub_key_hash)?
                .iter()
                .map(|out| out.get_value())
                .sum();
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(&config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            if !validate_address(&from) {
                return Err(BlockchainError::InvalidAddress(from));
            }
            if !validate_address(&to) {
                return Err(BlockchainError::InvalidAddress(to));
            }

            let blockchain = Blockchain::new_blockchain_with_path(&config.blockchain_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            if utxo_set.is_stale()? {
                utxo_set.reindex()?;
            }

            let wallets = Wallets::load(&config.wallet_path())?;
            let wallet = wallets.get_wallet(&from).ok_or_else(|| {
                BlockchainError::Wallet(format!("No key pair for {from} in this node's wallet"))
            })?;
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                // the sender collects the reward when mining locally
                let coinbase_tx = Transaction::new_coinbase_tx(&from, None)?;
                let block = blockchain.mine_block(&[transaction, coinbase_tx])?;
                utxo_set.update(&block)?;
            } else {
                send_tx(
                    &TcpTransport::default(),
                    &config.get_node_address(),
                    config.get_hub_address(),
                    &transaction,
                )?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::new_blockchain_with_path(&config.blockchain_path())?;
            let mut block_iterator = blockchain.iterator();
            while let Some(block) = block_iterator.try_next()? {
                println!("============ Block {} ============", block.get_hash_hex());
                println!("Height: {}", block.get_height());
                println!(
                    "Prev. block: {}",
                    data_encoding::HEXLOWER.encode(block.get_pre_block_hash())
                );
                println!("Timestamp: {}", block.get_timestamp());
                println!("Nonce: {}", block.get_nonce());
                for tx in block.get_transactions() {
                    println!("- Transaction {}", tx.get_id_hex());
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let address = convert_address(&hash_pub_key(input.get_pub_key()));
                            println!(
                                "-- Input txid = {}, vout = {}, from = {address}",
                                data_encoding::HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        let address = convert_address(output.get_pub_key_hash());
                        println!("-- Output value = {}, to = {address}", output.get_value())
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::new_blockchain_with_path(&config.blockchain_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = miner {
                config.set_mining_address(addr);
                config.validate()?;
            }
            if let Some(addr) = config.get_mining_address() {
                info!("Mining is on. Address to receive rewards: {addr}");
            }

            let blockchain = Blockchain::new_blockchain_with_path(&config.blockchain_path())?;
            // an interrupted sync leaves the cache behind the tip
            let utxo_set = UTXOSet::new(blockchain.clone());
            if utxo_set.is_stale()? {
                utxo_set.reindex()?;
            }
            let state = NodeState::new(
                &config.get_node_address(),
                config.get_hub_address(),
                config.get_mining_address().map(str::to_string),
            );
            let server = Server::new(blockchain, state, Arc::new(TcpTransport::default()));
            server.run()?
        }
    }
    Ok(())
}
