//! Peer-to-peer gossip protocol
//!
//! Nodes exchange one message per TCP connection: a 12-byte command tag and a
//! JSON payload. The first known peer acts as hub and relays transactions;
//! a node with a mining address turns its mempool into blocks.

pub mod message;
pub mod node;
pub mod server;
pub mod transport;

pub use message::{Message, OpType, COMMAND_LENGTH, NODE_VERSION};
pub use node::{Node, Nodes};
pub use server::{send_tx, NodeState, Server};
pub use transport::{TcpTransport, Transport};
