//! DNS-over-TLS driver (RFC 7858).
//!
//! Same length-prefixed framing as TCP, wrapped in TLS. Established sessions
//! are kept in a small idle pool per (address, hostname); a stale pooled
//! connection falls back to a fresh handshake.

use super::{check_response_id, Upstream};
use crate::codec;
use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use dashmap::DashMap;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

const MAX_IDLE_PER_HOST: usize = 2;

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
});

type TlsConnection = TlsStream<TcpStream>;
type PoolKey = (SocketAddr, String);

static TLS_POOL: LazyLock<DashMap<PoolKey, Vec<TlsConnection>>> = LazyLock::new(DashMap::new);

pub struct TlsUpstream {
    server_addr: SocketAddr,
    hostname: String,
    address: String,
    timeout: Duration,
}

impl TlsUpstream {
    pub fn new(
        server_addr: SocketAddr,
        hostname: String,
        address: String,
        timeout: Duration,
    ) -> Self {
        Self {
            server_addr,
            hostname,
            address,
            timeout,
        }
    }

    fn take_pooled(&self) -> Option<TlsConnection> {
        let key = (self.server_addr, self.hostname.clone());
        TLS_POOL.get_mut(&key)?.pop()
    }

    fn return_to_pool(&self, stream: TlsConnection) {
        let key = (self.server_addr, self.hostname.clone());
        let mut entry = TLS_POOL.entry(key).or_default();
        if entry.len() < MAX_IDLE_PER_HOST {
            entry.push(stream);
        }
    }

    async fn connect_new(&self) -> Result<TlsConnection, ProxyError> {
        let connector = tokio_rustls::TlsConnector::from(SHARED_TLS_CONFIG.clone());

        let server_name =
            ServerName::try_from(self.hostname.clone()).map_err(|e| ProxyError::Config(format!(
                "invalid TLS hostname '{}': {}",
                self.hostname, e
            )))?;

        let tcp_stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.server_addr))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                server: self.address.clone(),
            })?
            .map_err(|e| ProxyError::Transport {
                server: self.address.clone(),
                message: format!("connect failed: {}", e),
            })?;

        let tls_stream =
            tokio::time::timeout(self.timeout, connector.connect(server_name, tcp_stream))
                .await
                .map_err(|_| ProxyError::TransportTimeout {
                    server: self.address.clone(),
                })?
                .map_err(|e| ProxyError::Transport {
                    server: self.address.clone(),
                    message: format!("TLS handshake failed: {}", e),
                })?;

        debug!(server = %self.server_addr, hostname = %self.hostname, "TLS connection established");
        Ok(tls_stream)
    }

    async fn exchange_on_stream(
        &self,
        stream: &mut TlsConnection,
        wire: &[u8],
    ) -> Result<Vec<u8>, ProxyError> {
        tokio::time::timeout(self.timeout, codec::write_prefixed(stream, wire))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                server: self.address.clone(),
            })??;

        let response = tokio::time::timeout(self.timeout, codec::read_prefixed(stream))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                server: self.address.clone(),
            })??;

        Ok(response)
    }
}

#[async_trait]
impl Upstream for TlsUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError> {
        let wire = codec::pack(request)?;

        if let Some(mut stream) = self.take_pooled() {
            match self.exchange_on_stream(&mut stream, &wire).await {
                Ok(response_bytes) => {
                    let response = codec::unpack(&response_bytes)?;
                    check_response_id(&self.address, request, &response)?;
                    self.return_to_pool(stream);
                    return Ok(response);
                }
                Err(_) => {
                    debug!(server = %self.server_addr, "pooled TLS connection stale, reconnecting");
                }
            }
        }

        let mut stream = self.connect_new().await?;
        let response_bytes = self.exchange_on_stream(&mut stream, &wire).await?;
        let response = codec::unpack(&response_bytes)?;
        check_response_id(&self.address, request, &response)?;
        self.return_to_pool(stream);
        Ok(response)
    }

    fn address(&self) -> &str {
        &self.address
    }
}
