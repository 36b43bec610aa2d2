//! Per-request context handed through the pipeline.

use hickory_proto::op::Message;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Transport the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
    Https,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
            Proto::Tls => "tls",
            Proto::Https => "https",
        }
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the pipeline needs to know about one request. Created when a
/// packet parses, dropped once the response has been written and the event
/// emitted. The proxy's shared state is passed as explicit parameters, never
/// stashed here.
pub struct DnsContext {
    pub proto: Proto,
    pub req: Message,
    pub peer: SocketAddr,
    pub start: Instant,
    /// Address string of the upstream that ended up serving the request.
    pub upstream_addr: Option<String>,
    pub upstream_idx: Option<usize>,
    /// In-process `resolve()` calls have no spoofable source address and
    /// bypass the UDP rate limiter.
    pub internal: bool,
}

impl DnsContext {
    pub fn new(proto: Proto, req: Message, peer: SocketAddr) -> Self {
        Self {
            proto,
            req,
            peer,
            start: Instant::now(),
            upstream_addr: None,
            upstream_idx: None,
            internal: false,
        }
    }

    /// Context for a wire-form query fed in directly by the embedding layer.
    pub fn internal(req: Message) -> Self {
        let mut ctx = Self::new(
            Proto::Udp,
            req,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        );
        ctx.internal = true;
        ctx
    }
}
