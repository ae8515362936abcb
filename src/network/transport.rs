use crate::error::{BlockchainError, Result};
use log::debug;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

const TCP_WRITE_TIMEOUT: u64 = 5000;

/// Delivers one encoded message to a peer.
pub trait Transport: Send + Sync {
    fn send(&self, addr: &str, data: &[u8]) -> Result<()>;
}

/// One TCP connection per message; the write half is closed so the receiver
/// sees end of stream.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport {
            timeout: Duration::from_millis(TCP_WRITE_TIMEOUT),
        }
    }
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> TcpTransport {
        TcpTransport { timeout }
    }
}

impl Transport for TcpTransport {
    fn send(&self, addr: &str, data: &[u8]) -> Result<()> {
        let socket_addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?;

        let mut stream = TcpStream::connect_timeout(&socket_addr, self.timeout)
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

        stream
            .write_all(data)
            .and_then(|_| stream.flush())
            .map_err(|e| BlockchainError::Network(format!("Failed to send data to {addr}: {e}")))?;
        let _ = stream.shutdown(Shutdown::Write);

        debug!("Sent {} byte(s) to {addr}", data.len());
        Ok(())
    }
}
