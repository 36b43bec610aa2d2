use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_PLAIN_PORT: u16 = 53;
const DEFAULT_TLS_PORT: u16 = 853;

/// An upstream server address that may or may not be resolved to an IP yet.
/// Hostname forms are resolved through the bootstrap servers at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddr {
    Resolved(SocketAddr),
    Unresolved { hostname: Arc<str>, port: u16 },
}

impl UpstreamAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            UpstreamAddr::Resolved(addr) => Some(*addr),
            UpstreamAddr::Unresolved { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            UpstreamAddr::Resolved(addr) => addr.port(),
            UpstreamAddr::Unresolved { port, .. } => *port,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, UpstreamAddr::Unresolved { .. })
    }

    /// Returns (hostname, port) if this address still needs resolution.
    pub fn unresolved_parts(&self) -> Option<(&str, u16)> {
        match self {
            UpstreamAddr::Unresolved { hostname, port } => Some((hostname, *port)),
            UpstreamAddr::Resolved(_) => None,
        }
    }

    pub fn with_resolved_ip(&self, ip: IpAddr) -> Self {
        UpstreamAddr::Resolved(SocketAddr::new(ip, self.port()))
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAddr::Resolved(addr) => write!(f, "{}", addr),
            UpstreamAddr::Unresolved { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

/// A parsed upstream endpoint URL.
///
/// Recognized schemes: `udp://`, `tcp://`, `tls://`, `https://`, `sdns://`,
/// plus bare `IP[:PORT]` / `HOST[:PORT]` which imply plain UDP on port 53.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamUrl {
    Udp { addr: UpstreamAddr },
    Tcp { addr: UpstreamAddr },
    Tls { addr: UpstreamAddr, hostname: Arc<str> },
    Https { url: Arc<str>, hostname: Arc<str> },
    /// DNSCrypt server stamp. Recognized so configurations carry it, but the
    /// concrete driver lives outside this workspace.
    DnsCrypt { stamp: Arc<str> },
}

impl UpstreamUrl {
    pub fn scheme(&self) -> &'static str {
        match self {
            UpstreamUrl::Udp { .. } => "udp",
            UpstreamUrl::Tcp { .. } => "tcp",
            UpstreamUrl::Tls { .. } => "tls",
            UpstreamUrl::Https { .. } => "https",
            UpstreamUrl::DnsCrypt { .. } => "sdns",
        }
    }

    pub fn addr(&self) -> Option<&UpstreamAddr> {
        match self {
            UpstreamUrl::Udp { addr } | UpstreamUrl::Tcp { addr } | UpstreamUrl::Tls { addr, .. } => {
                Some(addr)
            }
            UpstreamUrl::Https { .. } | UpstreamUrl::DnsCrypt { .. } => None,
        }
    }

    /// Returns `true` if this endpoint has a hostname that needs resolution
    /// through the bootstrap servers before a driver can be built.
    pub fn needs_resolution(&self) -> bool {
        self.addr().is_some_and(UpstreamAddr::is_unresolved)
    }

    pub fn with_resolved_ip(&self, ip: IpAddr) -> Self {
        match self {
            UpstreamUrl::Udp { addr } => UpstreamUrl::Udp {
                addr: addr.with_resolved_ip(ip),
            },
            UpstreamUrl::Tcp { addr } => UpstreamUrl::Tcp {
                addr: addr.with_resolved_ip(ip),
            },
            UpstreamUrl::Tls { addr, hostname } => UpstreamUrl::Tls {
                addr: addr.with_resolved_ip(ip),
                hostname: hostname.clone(),
            },
            UpstreamUrl::Https { .. } | UpstreamUrl::DnsCrypt { .. } => self.clone(),
        }
    }
}

fn parse_host_port(s: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        match rest[end + 1..].strip_prefix(':') {
            Some(port_str) => Some((host, Some(port_str.parse::<u16>().ok()?))),
            None if rest[end + 1..].is_empty() => Some((host, None)),
            None => None,
        }
    } else if let Some((host, port_str)) = s.rsplit_once(':') {
        // More than one bare colon means an IPv6 literal without brackets.
        if host.contains(':') {
            return Some((s, None));
        }
        Some((host, Some(port_str.parse::<u16>().ok()?)))
    } else {
        Some((s, None))
    }
}

fn parse_upstream_addr(s: &str, default_port: u16) -> Result<UpstreamAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(UpstreamAddr::Resolved(addr));
    }
    let (host, port) = parse_host_port(s).ok_or_else(|| format!("invalid address '{}'", s))?;
    let port = port.unwrap_or(default_port);
    if host.is_empty() {
        return Err(format!("invalid address '{}'", s));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(UpstreamAddr::Resolved(SocketAddr::new(ip, port)));
    }
    Ok(UpstreamAddr::Unresolved {
        hostname: host.into(),
        port,
    })
}

impl FromStr for UpstreamUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("udp://") {
            let addr = parse_upstream_addr(rest, DEFAULT_PLAIN_PORT)?;
            return Ok(UpstreamUrl::Udp { addr });
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = parse_upstream_addr(rest, DEFAULT_PLAIN_PORT)?;
            return Ok(UpstreamUrl::Tcp { addr });
        }
        if let Some(rest) = s.strip_prefix("tls://") {
            let addr = parse_upstream_addr(rest, DEFAULT_TLS_PORT)?;
            let hostname: Arc<str> = match &addr {
                UpstreamAddr::Resolved(sa) => sa.ip().to_string().into(),
                UpstreamAddr::Unresolved { hostname, .. } => hostname.clone(),
            };
            return Ok(UpstreamUrl::Tls { addr, hostname });
        }
        if s.starts_with("https://") {
            let hostname: Arc<str> = s
                .strip_prefix("https://")
                .and_then(|rest| rest.split('/').next())
                .filter(|h| !h.is_empty())
                .map(|h| h.split(':').next().unwrap_or(h))
                .ok_or_else(|| format!("invalid HTTPS URL '{}'", s))?
                .into();
            return Ok(UpstreamUrl::Https {
                url: s.into(),
                hostname,
            });
        }
        if let Some(stamp) = s.strip_prefix("sdns://") {
            if stamp.is_empty() {
                return Err(format!("invalid DNS stamp '{}'", s));
            }
            return Ok(UpstreamUrl::DnsCrypt { stamp: s.into() });
        }
        if s.contains("://") {
            return Err(format!(
                "unsupported upstream scheme in '{}'. Expected udp://, tcp://, tls://, https:// or sdns://",
                s
            ));
        }
        // Bare address means plain UDP.
        let addr = parse_upstream_addr(s, DEFAULT_PLAIN_PORT)?;
        Ok(UpstreamUrl::Udp { addr })
    }
}

impl fmt::Display for UpstreamUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamUrl::Udp { addr } => write!(f, "udp://{}", addr),
            UpstreamUrl::Tcp { addr } => write!(f, "tcp://{}", addr),
            UpstreamUrl::Tls { addr, hostname } => {
                write!(f, "tls://{}:{}", hostname, addr.port())
            }
            UpstreamUrl::Https { url, .. } => write!(f, "{}", url),
            UpstreamUrl::DnsCrypt { stamp } => write!(f, "{}", stamp),
        }
    }
}
