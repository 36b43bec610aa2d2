//! Plain DNS-over-TCP driver.

use super::{check_response_id, Upstream};
use crate::codec;
use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub struct TcpUpstream {
    server_addr: SocketAddr,
    address: String,
    timeout: Duration,
}

impl TcpUpstream {
    pub fn new(server_addr: SocketAddr, address: String, timeout: Duration) -> Self {
        Self {
            server_addr,
            address,
            timeout,
        }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError> {
        let wire = codec::pack(request)?;
        let response_bytes = exchange_wire(self.server_addr, &wire, self.timeout).await?;
        let response = codec::unpack(&response_bytes)?;
        check_response_id(&self.address, request, &response)?;
        Ok(response)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Connect, send one length-prefixed message, read one length-prefixed
/// reply. Also serves the UDP driver's truncation retry.
pub(crate) async fn exchange_wire(
    server_addr: SocketAddr,
    wire: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ProxyError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server_addr.to_string(),
        })?
        .map_err(|e| ProxyError::Transport {
            server: server_addr.to_string(),
            message: format!("connect failed: {}", e),
        })?;

    tokio::time::timeout(timeout, codec::write_prefixed(&mut stream, wire))
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server_addr.to_string(),
        })??;

    debug!(server = %server_addr, message_len = wire.len(), "TCP query sent");

    let response = tokio::time::timeout(timeout, codec::read_prefixed(&mut stream))
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server_addr.to_string(),
        })??;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_configured_address_string() {
        let upstream = TcpUpstream::new(
            "9.9.9.9:53".parse().unwrap(),
            "tcp://9.9.9.9:53".into(),
            Duration::from_secs(5),
        );
        assert_eq!(upstream.address(), "tcp://9.9.9.9:53");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Port 1 on loopback is almost certainly closed.
        let result = exchange_wire(
            "127.0.0.1:1".parse().unwrap(),
            &[0u8; 17],
            Duration::from_millis(500),
        )
        .await;
        assert!(result.is_err());
    }
}
