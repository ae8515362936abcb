use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "powchain", about = "A minimal proof-of-work ledger node")]
pub struct Opt {
    #[arg(
        long = "config",
        global = true,
        default_value = crate::config::DEFAULT_CONFIG_FILE,
        help = "Path to the TOML configuration file"
    )]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(help = "The address to send genesis block reward to")]
        address: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(name = "send", about = "Send transaction between addresses")]
    Send {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send")]
        amount: u64,
        #[arg(long = "mine", help = "Mine immediately on the same node")]
        mine: bool,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a blockchain node")]
    StartNode {
        #[arg(
            long = "miner",
            value_name = "ADDRESS",
            help = "Enable mining mode and send reward to ADDRESS"
        )]
        miner: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_with_mine_flag() {
        let opt = Opt::try_parse_from(["powchain", "send", "a", "b", "5", "--mine"]).unwrap();
        assert_eq!(
            opt.command,
            Command::Send {
                from: "a".to_string(),
                to: "b".to_string(),
                amount: 5,
                mine: true,
            }
        );
        assert_eq!(opt.config, PathBuf::from(crate::config::DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_parse_startnode_miner() {
        let opt = Opt::try_parse_from([
            "powchain",
            "--config",
            "node.toml",
            "startnode",
            "--miner",
            "addr",
        ])
        .unwrap();
        assert_eq!(
            opt.command,
            Command::StartNode {
                miner: Some("addr".to_string())
            }
        );
        assert_eq!(opt.config, PathBuf::from("node.toml"));
    }

    #[test]
    fn test_rejects_negative_amount() {
        assert!(Opt::try_parse_from(["powchain", "send", "a", "b", "-3"]).is_err());
    }
}
