use crate::error::{BlockchainError, Result};
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr }
    }

    pub fn get_addr(&self) -> String {
        self.addr.clone()
    }

    pub fn parse_socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| BlockchainError::Network(format!("Invalid node address {}: {e}", self.addr)))
    }
}

/// Known peers in discovery order. The first entry is the hub.
pub struct Nodes {
    inner: RwLock<Vec<Node>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(vec![]),
        }
    }

    /// Adds `addr` unless already known. Returns whether it was new.
    pub fn add_node(&self, addr: String) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.iter().any(|x| x.addr == addr) {
            return false;
        }
        inner.push(Node::new(addr));
        true
    }

    pub fn evict_node(&self, addr: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = inner.iter().position(|x| x.addr == addr) {
            inner.remove(idx);
        }
    }

    pub fn first(&self) -> Option<Node> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }

    pub fn get_addresses(&self) -> Vec<String> {
        self.get_nodes().iter().map(Node::get_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|x| x.addr == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_keep_discovery_order() {
        let nodes = Nodes::new();
        assert!(nodes.add_node("127.0.0.1:3000".to_string()));
        assert!(nodes.add_node("127.0.0.1:3001".to_string()));
        assert!(!nodes.add_node("127.0.0.1:3000".to_string()));

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.first().unwrap().get_addr(), "127.0.0.1:3000");

        nodes.evict_node("127.0.0.1:3000");
        assert!(!nodes.node_is_known("127.0.0.1:3000"));
        assert_eq!(nodes.get_addresses(), vec!["127.0.0.1:3001".to_string()]);
    }

    #[test]
    fn test_parse_socket_addr() {
        let nodes = Nodes::new();
        nodes.add_node("127.0.0.1:3000".to_string());
        nodes.add_node("localhost".to_string());
        let parsed: Vec<bool> = nodes
            .get_nodes()
            .iter()
            .map(|n| n.parse_socket_addr().is_ok())
            .collect();
        assert_eq!(parsed, vec![true, false]);
    }
}
