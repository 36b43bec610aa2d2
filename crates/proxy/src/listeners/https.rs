//! DNS-over-HTTPS listener (RFC 8484).
//!
//! GET carries the query as an unpadded base64url `dns=` parameter, POST as
//! an `application/dns-message` body. The router is plain axum; TLS
//! termination happens in the accept loop below it.

use crate::codec;
use crate::context::{DnsContext, Proto};
use crate::pipeline::Pipeline;
use axum::body::Bytes;
use axum::extract::{Extension, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use corten_dns_domain::ProxyError;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";
const SERVER_BANNER: &str = "corten-dns";

#[derive(Clone)]
struct DohState {
    pipeline: Arc<Pipeline>,
}

/// Peer address injected per connection by the accept loop.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Builds the DoH router. Public so tests can drive it without sockets.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/dns-query", get(handle_get).post(handle_post))
        .with_state(DohState { pipeline })
}

async fn handle_get(
    State(state): State<DohState>,
    peer: Option<Extension<ClientAddr>>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(param) = query
        .as_deref()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("dns=")))
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let wire = match URL_SAFE_NO_PAD.decode(param) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    serve_wire(state, client_addr(peer), wire).await
}

async fn handle_post(
    State(state): State<DohState>,
    peer: Option<Extension<ClientAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != DNS_MESSAGE_CONTENT_TYPE {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    if body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    serve_wire(state, client_addr(peer), body.to_vec()).await
}

fn client_addr(peer: Option<Extension<ClientAddr>>) -> SocketAddr {
    peer.map(|Extension(ClientAddr(addr))| addr)
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

async fn serve_wire(state: DohState, peer: SocketAddr, wire: Vec<u8>) -> Response {
    let request = match codec::unpack(&wire) {
        Ok(message) => message,
        Err(e) => {
            debug!(peer = %peer, error = %e, "rejecting unparseable DoH body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut ctx = DnsContext::new(Proto::Https, request, peer);
    let Some(response) = state.pipeline.handle(&mut ctx).await else {
        // The rate limiter only applies to UDP; DoH requests always answer.
        warn!(peer = %peer, "pipeline returned no response for a DoH request");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    match codec::pack(&response) {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE),
                (header::SERVER, SERVER_BANNER),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to encode DoH response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub struct HttpsListener {
    listener: TcpListener,
    tls: TlsAcceptor,
    local_addr: SocketAddr,
}

impl HttpsListener {
    pub async fn bind(
        addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::io)?;
        let local_addr = listener.local_addr().map_err(ProxyError::io)?;
        info!(addr = %local_addr, "listening on https://");
        Ok(Self {
            listener,
            tls: TlsAcceptor::from(tls_config),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self, pipeline: Arc<Pipeline>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let app = router(pipeline);
        tokio::spawn(async move {
            let mut accept_shutdown = shutdown.clone();
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => {
                        debug!(addr = %self.local_addr, "HTTPS listener shutting down");
                        return;
                    }
                    accepted = self.listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "HTTPS accept failed");
                                continue;
                            }
                        };
                        let acceptor = self.tls.clone();
                        let app = app.clone().layer(Extension(ClientAddr(peer)));
                        let mut conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(tls_stream) => tls_stream,
                                Err(e) => {
                                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                            };
                            let service = TowerToHyperService::new(app);
                            let builder =
                                hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                            tokio::select! {
                                _ = conn_shutdown.changed() => {}
                                served = builder.serve_connection(TokioIo::new(tls_stream), service) => {
                                    if let Err(e) = served {
                                        debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
                                    }
                                }
                            }
                        });
                    }
                }
            }
        })
    }
}
