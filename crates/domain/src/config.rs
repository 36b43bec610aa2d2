use crate::errors::ProxyError;
use crate::upstream_url::UpstreamUrl;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Exchange deadline applied when the embedder does not set one. Also the
/// RTT substituted into the selector for a failed exchange.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_MAX_PARALLEL: usize = 8;

/// Fully typed proxy configuration. Built directly by Rust embedders, or
/// parsed from the string-valued [`RawConfig`] that mobile-style embedding
/// layers hand over.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: IpAddr,
    /// 0 lets the kernel pick a free port.
    pub listen_port: u16,
    /// Plain-DNS servers used only to resolve upstream hostnames at startup.
    pub bootstrap: Vec<SocketAddr>,
    pub upstreams: Vec<UpstreamUrl>,
    /// Tried once, in order, when the chosen upstream fails.
    pub fallbacks: Vec<UpstreamUrl>,
    pub timeout_ms: u64,
    /// Cap on concurrent upstream exchanges.
    pub max_parallel: usize,
    /// 0 disables the response cache.
    pub cache_size: usize,
    /// Candidate DNS64 resolvers, one per line, filtered to IPv6 literals.
    pub dns64_upstreams: Vec<String>,
    pub refuse_any: bool,
    /// Per-client UDP queries per second; 0 disables rate limiting.
    pub ratelimit: u32,
    pub ratelimit_whitelist: Vec<IpAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            bootstrap: Vec::new(),
            upstreams: Vec::new(),
            fallbacks: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            cache_size: 0,
            dns64_upstreams: Vec::new(),
            refuse_any: false,
            ratelimit: 0,
            ratelimit_whitelist: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.upstreams.is_empty() {
            return Err(ProxyError::Config("no upstreams specified".into()));
        }
        let needs_bootstrap = self
            .upstreams
            .iter()
            .chain(self.fallbacks.iter())
            .any(UpstreamUrl::needs_resolution);
        if needs_bootstrap && self.bootstrap.is_empty() {
            return Err(ProxyError::Config(
                "upstreams use hostnames but no bootstrap DNS is configured".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(if self.timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            self.timeout_ms
        })
    }
}

/// The option set exposed to embedding layers: every list is a
/// newline-separated string so it survives FFI boundaries unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap_dns: String,
    #[serde(default)]
    pub fallbacks: String,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub upstreams: String,
    #[serde(default)]
    pub max_parallel: usize,
    #[serde(default)]
    pub cache_size: usize,
    #[serde(default)]
    pub dns64_upstreams: String,
    #[serde(default)]
    pub refuse_any: bool,
    #[serde(default)]
    pub ratelimit: u32,
    #[serde(default)]
    pub ratelimit_whitelist: String,
}

fn list_entries(s: &str) -> impl Iterator<Item = &str> {
    s.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn parse_socket_addr(s: &str) -> Result<SocketAddr, ProxyError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(ProxyError::Config(format!("invalid address '{}'", s)))
}

impl RawConfig {
    pub fn parse(&self) -> Result<ProxyConfig, ProxyError> {
        let listen_addr = if self.listen_addr.is_empty() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.listen_addr
                .parse::<IpAddr>()
                .map_err(|_| ProxyError::Config(format!("invalid listen address '{}'", self.listen_addr)))?
        };

        let upstreams = list_entries(&self.upstreams)
            .map(|l| l.parse::<UpstreamUrl>().map_err(ProxyError::Config))
            .collect::<Result<Vec<_>, _>>()?;
        let fallbacks = list_entries(&self.fallbacks)
            .map(|l| l.parse::<UpstreamUrl>().map_err(ProxyError::Config))
            .collect::<Result<Vec<_>, _>>()?;
        let bootstrap = list_entries(&self.bootstrap_dns)
            .map(parse_socket_addr)
            .collect::<Result<Vec<_>, _>>()?;
        let ratelimit_whitelist = list_entries(&self.ratelimit_whitelist)
            .map(|l| {
                l.parse::<IpAddr>()
                    .map_err(|_| ProxyError::Config(format!("invalid whitelist IP '{}'", l)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = ProxyConfig {
            listen_addr,
            listen_port: self.listen_port,
            bootstrap,
            upstreams,
            fallbacks,
            timeout_ms: if self.timeout_ms == 0 {
                DEFAULT_TIMEOUT_MS
            } else {
                self.timeout_ms
            },
            max_parallel: if self.max_parallel == 0 {
                DEFAULT_MAX_PARALLEL
            } else {
                self.max_parallel
            },
            cache_size: self.cache_size,
            dns64_upstreams: list_entries(&self.dns64_upstreams)
                .map(str::to_owned)
                .collect(),
            refuse_any: self.refuse_any,
            ratelimit: self.ratelimit,
            ratelimit_whitelist,
        };
        config.validate()?;
        Ok(config)
    }
}
