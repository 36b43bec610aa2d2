//! Plain DNS-over-UDP driver (RFC 1035 §4.2.1).
//!
//! Messages go out unframed on an ephemeral socket. A truncated (TC) reply
//! means the answer did not fit: the exchange is retried over TCP.

use super::{check_response_id, Upstream};
use crate::codec;
use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Responses larger than this arrive truncated and are retried over TCP.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

pub struct UdpUpstream {
    server_addr: SocketAddr,
    address: String,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(server_addr: SocketAddr, address: String, timeout: Duration) -> Self {
        Self {
            server_addr,
            address,
            timeout,
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError> {
        let wire = codec::pack(request)?;
        let response_bytes = exchange_wire(self.server_addr, &wire, self.timeout).await?;
        let response = codec::unpack(&response_bytes)?;
        check_response_id(&self.address, request, &response)?;

        if response.truncated() {
            debug!(server = %self.server_addr, "UDP response truncated, retrying over TCP");
            let tcp_bytes = super::tcp::exchange_wire(self.server_addr, &wire, self.timeout).await?;
            let tcp_response = codec::unpack(&tcp_bytes)?;
            check_response_id(&self.address, request, &tcp_response)?;
            return Ok(tcp_response);
        }

        Ok(response)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// One request/response round trip over plain UDP. Shared with the bootstrap
/// resolver and the DNS64 prober.
pub(crate) async fn exchange_wire(
    server_addr: SocketAddr,
    wire: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ProxyError> {
    let bind_addr: SocketAddr = if server_addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| ProxyError::Transport {
        server: server_addr.to_string(),
        message: format!("failed to bind UDP socket: {}", e),
    })?;

    tokio::time::timeout(timeout, socket.send_to(wire, server_addr))
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server_addr.to_string(),
        })?
        .map_err(|e| ProxyError::Transport {
            server: server_addr.to_string(),
            message: format!("failed to send query: {}", e),
        })?;

    let mut recv_buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let (received, from_addr) = tokio::time::timeout(timeout, socket.recv_from(&mut recv_buf))
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server_addr.to_string(),
        })?
        .map_err(|e| ProxyError::Transport {
            server: server_addr.to_string(),
            message: format!("failed to receive response: {}", e),
        })?;

    if from_addr.ip() != server_addr.ip() {
        warn!(
            expected = %server_addr,
            received_from = %from_addr,
            "UDP response from unexpected source"
        );
    }

    recv_buf.truncate(received);
    Ok(recv_buf)
}

/// Convenience wrapper used by startup probes: pack, exchange, unpack.
pub(crate) async fn exchange_message(
    server_addr: SocketAddr,
    request: &Message,
    timeout: Duration,
) -> Result<Message, ProxyError> {
    let wire = codec::pack(request)?;
    let response_bytes = exchange_wire(server_addr, &wire, timeout).await?;
    let response = codec::unpack(&response_bytes)?;
    check_response_id(&server_addr.to_string(), request, &response)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_configured_address_string() {
        let upstream = UdpUpstream::new(
            "8.8.8.8:53".parse().unwrap(),
            "udp://8.8.8.8:53".into(),
            Duration::from_secs(5),
        );
        assert_eq!(upstream.address(), "udp://8.8.8.8:53");
    }

    #[tokio::test]
    async fn exchange_times_out_against_blackhole() {
        // 192.0.2.0/24 is TEST-NET-1, nothing answers there.
        let result = exchange_wire(
            "192.0.2.1:53".parse().unwrap(),
            &[0u8; 17],
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::TransportTimeout { .. })));
    }
}
