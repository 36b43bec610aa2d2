//! Startup resolution of hostname-form upstream addresses.
//!
//! `tls://dns.example.net` names a host the proxy itself cannot resolve
//! through its own upstreams (they are not built yet). The configured
//! bootstrap servers are plain DNS resolvers asked once, at startup, for the
//! upstream hosts' addresses.

use crate::codec;
use crate::upstream::udp;
use corten_dns_domain::{ProxyError, UpstreamAddr, UpstreamUrl};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Returns the upstream list with every hostname replaced by an IP address.
/// Endpoints that are already resolved (or have no address, like DoH URLs)
/// pass through unchanged.
pub async fn resolve_upstreams(
    urls: &[UpstreamUrl],
    bootstrap: &[SocketAddr],
    timeout: Duration,
) -> Result<Vec<UpstreamUrl>, ProxyError> {
    let mut resolved = Vec::with_capacity(urls.len());
    for url in urls {
        match url.addr().and_then(UpstreamAddr::unresolved_parts) {
            Some((hostname, _)) => {
                let ip = lookup_host(hostname, bootstrap, timeout).await?;
                info!(hostname, ip = %ip, "resolved upstream host via bootstrap");
                resolved.push(url.with_resolved_ip(ip));
            }
            None => resolved.push(url.clone()),
        }
    }
    Ok(resolved)
}

async fn lookup_host(
    hostname: &str,
    servers: &[SocketAddr],
    timeout: Duration,
) -> Result<IpAddr, ProxyError> {
    let name = Name::from_str(&format!("{}.", hostname.trim_end_matches('.')))
        .map_err(|e| ProxyError::Bootstrap {
            hostname: hostname.to_string(),
            message: format!("invalid hostname: {}", e),
        })?;

    let mut last_error = String::from("no bootstrap servers configured");
    for server in servers {
        for record_type in [RecordType::A, RecordType::AAAA] {
            let query = codec::new_query(name.clone(), record_type);
            match udp::exchange_message(*server, &query, timeout).await {
                Ok(reply) => {
                    if let Some(ip) = first_address(&reply) {
                        return Ok(ip);
                    }
                    debug!(hostname, server = %server, ?record_type, "bootstrap reply had no addresses");
                }
                Err(e) => {
                    debug!(hostname, server = %server, error = %e, "bootstrap query failed");
                    last_error = e.to_string();
                }
            }
        }
    }

    Err(ProxyError::Bootstrap {
        hostname: hostname.to_string(),
        message: last_error,
    })
}

fn first_address(reply: &hickory_proto::op::Message) -> Option<IpAddr> {
    reply.answers().iter().find_map(|record| match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}
