//! TCP and DNS-over-TLS listeners.
//!
//! One task per accepted connection; within a connection, requests are
//! serviced serially so replies come back in arrival order. The first I/O
//! error, an idle read deadline, or shutdown closes the connection.

use super::IO_TIMEOUT;
use crate::codec;
use crate::context::{DnsContext, Proto};
use crate::pipeline::Pipeline;
use corten_dns_domain::ProxyError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct StreamListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    proto: Proto,
    local_addr: SocketAddr,
}

impl StreamListener {
    pub async fn bind_tcp(addr: SocketAddr) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::io)?;
        let local_addr = listener.local_addr().map_err(ProxyError::io)?;
        info!(addr = %local_addr, "listening on tcp://");
        Ok(Self {
            listener,
            tls: None,
            proto: Proto::Tcp,
            local_addr,
        })
    }

    pub async fn bind_tls(
        addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::io)?;
        let local_addr = listener.local_addr().map_err(ProxyError::io)?;
        info!(addr = %local_addr, "listening on tls://");
        Ok(Self {
            listener,
            tls: Some(TlsAcceptor::from(tls_config)),
            proto: Proto::Tls,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self, pipeline: Arc<Pipeline>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut accept_shutdown = shutdown.clone();
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => {
                        debug!(addr = %self.local_addr, proto = %self.proto, "stream listener shutting down");
                        return;
                    }
                    accepted = self.listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let pipeline = Arc::clone(&pipeline);
                        let shutdown = shutdown.clone();
                        let proto = self.proto;
                        match &self.tls {
                            None => {
                                tokio::spawn(serve_connection(stream, peer, proto, pipeline, shutdown));
                            }
                            Some(acceptor) => {
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            serve_connection(tls_stream, peer, proto, pipeline, shutdown)
                                                .await;
                                        }
                                        Err(e) => {
                                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                                        }
                                    }
                                });
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Serial request loop for one client stream.
async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    proto: Proto,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(peer = %peer, proto = %proto, "serving stream connection");
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => return,
            read = tokio::time::timeout(IO_TIMEOUT, codec::read_prefixed(&mut stream)) => {
                match read {
                    Ok(Ok(packet)) => packet,
                    // Deadline, EOF or framing error: close the connection.
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        };

        // A stream that sends garbage is closed, not ignored.
        let request = match codec::unpack(&packet) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "closing connection on unparseable message");
                return;
            }
        };

        let mut ctx = DnsContext::new(proto, request, peer);
        let Some(response) = pipeline.handle(&mut ctx).await else {
            continue;
        };

        let bytes = match codec::pack(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to encode response");
                return;
            }
        };
        match tokio::time::timeout(IO_TIMEOUT, codec::write_prefixed(&mut stream, &bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "failed to write response");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "timed out writing response");
                return;
            }
        }
    }
}
