use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use log::info;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const WALLET_FILE_PREFIX: &str = "wallet";

/// Location of a node's wallet file: `<data_dir>/wallet_<node_id>.dat`.
pub fn wallet_file_path(data_dir: &Path, node_id: &str) -> PathBuf {
    data_dir.join(format!("{WALLET_FILE_PREFIX}_{node_id}.dat"))
}

/// Key pairs owned by one node, keyed by address.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    /// Opens the wallet file at `path`, starting empty when it does not exist.
    pub fn load(path: &Path) -> Result<Wallets> {
        let mut wallets = Wallets {
            wallets: HashMap::new(),
            path: path.to_path_buf(),
        };
        if path.exists() {
            let bytes = fs::read(path)?;
            wallets.wallets = deserialize(&bytes).map_err(|e| {
                BlockchainError::Wallet(format!(
                    "Corrupted wallet file {}: {e}",
                    path.display()
                ))
            })?;
            info!(
                "Loaded {} wallet(s) from {}",
                wallets.wallets.len(),
                path.display()
            );
        }
        Ok(wallets)
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn save_to_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let wallets_bytes = serialize(&self.wallets)?;
        writer.write_all(wallets_bytes.as_slice())?;
        writer.flush()?;
        Ok(())
    }
}
