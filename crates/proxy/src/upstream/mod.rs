//! Upstream resolver drivers.
//!
//! Every driver speaks `exchange(request) -> response` over its own
//! transport. Drivers are built once at startup from parsed upstream URLs;
//! hostname-form addresses must already be resolved through the bootstrap
//! servers by then.

pub mod https;
pub mod tcp;
pub mod tls;
pub mod udp;

use async_trait::async_trait;
use corten_dns_domain::{ProxyError, UpstreamAddr, UpstreamUrl};
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError>;

    /// Stable address string for logs and events, in the configured URL form.
    fn address(&self) -> &str;
}

pub fn build(url: &UpstreamUrl, timeout: Duration) -> Result<Arc<dyn Upstream>, ProxyError> {
    let address = url.to_string();
    match url {
        UpstreamUrl::Udp { addr } => Ok(Arc::new(udp::UdpUpstream::new(
            resolved(addr)?,
            address,
            timeout,
        ))),
        UpstreamUrl::Tcp { addr } => Ok(Arc::new(tcp::TcpUpstream::new(
            resolved(addr)?,
            address,
            timeout,
        ))),
        UpstreamUrl::Tls { addr, hostname } => Ok(Arc::new(tls::TlsUpstream::new(
            resolved(addr)?,
            hostname.to_string(),
            address,
            timeout,
        ))),
        UpstreamUrl::Https { url, .. } => {
            Ok(Arc::new(https::HttpsUpstream::new(url.to_string(), timeout)))
        }
        UpstreamUrl::DnsCrypt { stamp } => Err(ProxyError::Config(format!(
            "DNSCrypt upstream '{}' requires an external driver",
            stamp
        ))),
    }
}

fn resolved(addr: &UpstreamAddr) -> Result<SocketAddr, ProxyError> {
    addr.socket_addr().ok_or_else(|| {
        ProxyError::Config(format!("upstream address {} was not resolved", addr))
    })
}

/// Responses must echo the query ID; anything else is a transport fault.
pub(crate) fn check_response_id(
    server: &str,
    request: &Message,
    response: &Message,
) -> Result<(), ProxyError> {
    if response.id() != request.id() {
        return Err(ProxyError::Transport {
            server: server.to_string(),
            message: format!(
                "response ID {:#06x} does not match query ID {:#06x}",
                response.id(),
                request.id()
            ),
        });
    }
    Ok(())
}
