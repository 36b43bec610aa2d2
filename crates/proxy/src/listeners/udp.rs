//! UDP listener: one task per datagram.

use super::IO_TIMEOUT;
use crate::codec;
use crate::context::{DnsContext, Proto};
use crate::pipeline::Pipeline;
use corten_dns_domain::ProxyError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(addr).await.map_err(ProxyError::io)?;
        let local_addr = socket.local_addr().map_err(ProxyError::io)?;
        info!(addr = %local_addr, "listening on udp://");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the receive loop until shutdown. Each datagram is copied out of
    /// the shared read buffer and handled on its own task, so a slow
    /// exchange never blocks the socket.
    pub fn spawn(self, pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; codec::MAX_MESSAGE_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!(addr = %self.local_addr, "UDP listener shutting down");
                        return;
                    }
                    received = self.socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let packet = buf[..len].to_vec();
                                let socket = Arc::clone(&self.socket);
                                let pipeline = Arc::clone(&pipeline);
                                tokio::spawn(handle_packet(socket, pipeline, packet, peer));
                            }
                            Err(e) => {
                                if *shutdown.borrow() {
                                    return;
                                }
                                warn!(error = %e, "UDP receive failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn handle_packet(
    socket: Arc<UdpSocket>,
    pipeline: Arc<Pipeline>,
    packet: Vec<u8>,
    peer: SocketAddr,
) {
    // Client parse errors on UDP are dropped silently.
    let request = match codec::unpack(&packet) {
        Ok(message) => message,
        Err(e) => {
            debug!(peer = %peer, error = %e, "dropping unparseable UDP packet");
            return;
        }
    };

    let mut ctx = DnsContext::new(Proto::Udp, request, peer);
    let Some(response) = pipeline.handle(&mut ctx).await else {
        return;
    };

    let bytes = match codec::pack(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to encode UDP response");
            return;
        }
    };
    match tokio::time::timeout(IO_TIMEOUT, socket.send_to(&bytes, peer)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "failed to write UDP response"),
        Err(_) => debug!(peer = %peer, "timed out writing UDP response"),
    }
}
