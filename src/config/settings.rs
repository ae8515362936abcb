use crate::error::{BlockchainError, Result};
use crate::wallet::{validate_address, wallet_file_path};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "powchain.toml";

const DEFAULT_NODE_ID: &str = "3000";
const DEFAULT_HUB_ADDRESS: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "data";

const NODE_ID_KEY: &str = "NODE_ID";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const DATA_DIR_KEY: &str = "DATA_DIR";
const HUB_ADDRESS_KEY: &str = "HUB_ADDRESS";

/// Node settings: defaults, then the TOML file, then environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    node_id: String,
    node_address: Option<String>,
    hub_address: String,
    data_dir: PathBuf,
    mining_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: DEFAULT_NODE_ID.to_string(),
            node_address: None,
            hub_address: DEFAULT_HUB_ADDRESS.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mining_address: None,
        }
    }
}

impl Config {
    /// Reads `path` when it exists and applies the process environment.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            Config::from_toml(&fs::read_to_string(path)?)?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup(NODE_ID_KEY) {
            self.node_id = node_id;
        }
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            self.node_address = Some(addr);
        }
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(hub) = lookup(HUB_ADDRESS_KEY) {
            self.hub_address = hub;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(BlockchainError::Config("node_id must not be empty".to_string()));
        }
        if let Some(addr) = &self.mining_address {
            if !validate_address(addr) {
                return Err(BlockchainError::Config(format!(
                    "mining_address {addr} is not a valid address"
                )));
            }
        }
        Ok(())
    }

    pub fn get_node_id(&self) -> &str {
        &self.node_id
    }

    /// Explicit address, or localhost on the port named by the node id.
    pub fn get_node_address(&self) -> String {
        self.node_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.node_id))
    }

    pub fn get_hub_address(&self) -> &str {
        &self.hub_address
    }

    pub fn get_mining_address(&self) -> Option<&str> {
        self.mining_address.as_deref()
    }

    pub fn set_mining_address(&mut self, addr: String) {
        self.mining_address = Some(addr);
    }

    pub fn get_data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn blockchain_path(&self) -> PathBuf {
        self.data_dir.join(format!("blocks_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        wallet_file_path(&self.data_dir, &self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::TEST_ADDRESS;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.get_node_id(), "3000");
        assert_eq!(config.get_node_address(), "127.0.0.1:3000");
        assert_eq!(config.get_hub_address(), "127.0.0.1:3000");
        assert_eq!(config.blockchain_path(), Path::new("data").join("blocks_3000"));
        assert_eq!(config.wallet_path(), Path::new("data").join("wallet_3000.dat"));
        assert!(config.get_mining_address().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(&format!(
            "node_id = \"3001\"\nmining_address = \"{TEST_ADDRESS}\"\n"
        ))
        .unwrap();
        assert_eq!(config.get_node_address(), "127.0.0.1:3001");
        assert_eq!(config.get_hub_address(), DEFAULT_HUB_ADDRESS);
        assert_eq!(config.get_mining_address(), Some(TEST_ADDRESS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut config = Config::from_toml("node_id = \"3001\"\ndata_dir = \"/var/a\"").unwrap();
        let env: HashMap<&str, &str> = [
            ("NODE_ID", "3002"),
            ("DATA_DIR", "/var/b"),
            ("HUB_ADDRESS", "10.0.0.1:3000"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.get_node_id(), "3002");
        assert_eq!(config.get_data_dir(), Path::new("/var/b"));
        assert_eq!(config.get_hub_address(), "10.0.0.1:3000");
        assert_eq!(config.get_node_address(), "127.0.0.1:3002");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_toml("node_id = 5"),
            Err(BlockchainError::Config(_))
        ));
        let config = Config::from_toml("mining_address = \"not-an-address\"").unwrap();
        assert!(matches!(config.validate(), Err(BlockchainError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert!(!config.get_node_id().is_empty());
    }
}
