use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

/// Width of the zero-padded ASCII command tag that prefixes every message.
pub const COMMAND_LENGTH: usize = 12;

pub const NODE_VERSION: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "blocks")]
    Block,
    #[serde(rename = "txs")]
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub addr_from: String,
    pub version: usize,
    pub best_height: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetData {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

/// A block in its bincode encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// A transaction in its bincode encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Addr(Addr),
    Version(Version),
    GetBlocks(GetBlocks),
    Inv(Inv),
    GetData(GetData),
    Block(BlockData),
    Tx(TxData),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Addr(_) => "addr",
            Message::Version(_) => "version",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "blocks",
            Message::Tx(_) => "txs",
        }
    }

    /// Command tag followed by the JSON payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Addr(p) => serde_json::to_vec(p)?,
            Message::Version(p) => serde_json::to_vec(p)?,
            Message::GetBlocks(p) => serde_json::to_vec(p)?,
            Message::Inv(p) => serde_json::to_vec(p)?,
            Message::GetData(p) => serde_json::to_vec(p)?,
            Message::Block(p) => serde_json::to_vec(p)?,
            Message::Tx(p) => serde_json::to_vec(p)?,
        };
        let mut bytes = command_to_bytes(self.command()).to_vec();
        bytes.extend(payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Serialization(format!(
                "Message of {} bytes is shorter than the command tag",
                bytes.len()
            )));
        }
        let (tag, payload) = bytes.split_at(COMMAND_LENGTH);
        let message = match bytes_to_command(tag)?.as_str() {
            "addr" => Message::Addr(serde_json::from_slice(payload)?),
            "version" => Message::Version(serde_json::from_slice(payload)?),
            "getblocks" => Message::GetBlocks(serde_json::from_slice(payload)?),
            "inv" => Message::Inv(serde_json::from_slice(payload)?),
            "getdata" => Message::GetData(serde_json::from_slice(payload)?),
            "blocks" => Message::Block(serde_json::from_slice(payload)?),
            "txs" => Message::Tx(serde_json::from_slice(payload)?),
            unknown => {
                return Err(BlockchainError::Serialization(format!(
                    "Unknown command: {unknown}"
                )))
            }
        };
        Ok(message)
    }

    /// Sender address carried by the payload; `addr` messages have none.
    pub fn addr_from(&self) -> Option<&str> {
        match self {
            Message::Addr(_) => None,
            Message::Version(p) => Some(&p.addr_from),
            Message::GetBlocks(p) => Some(&p.addr_from),
            Message::Inv(p) => Some(&p.addr_from),
            Message::GetData(p) => Some(&p.addr_from),
            Message::Block(p) => Some(&p.addr_from),
            Message::Tx(p) => Some(&p.addr_from),
        }
    }
}

pub fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.as_bytes()) {
        *slot = *byte;
    }
    bytes
}

pub fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|e| BlockchainError::Serialization(format!("Command tag is not ASCII: {e}")))
}
