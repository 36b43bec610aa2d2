//! NAT64 prefix discovery and AAAA synthesis (RFC 6052, RFC 7050).
//!
//! A DNS64 resolver answers an AAAA query for `ipv4only.arpa.` with a
//! synthesized address embedding one of the well-known IPv4 addresses
//! 192.0.0.170/171 in its low 32 bits. Stripping those four bytes from the
//! answer yields the resolver's /96 NAT64 prefix; only /96 is supported
//! here, so the embedded IPv4 address always occupies the final four bytes.

use crate::codec;
use crate::upstream::udp;
use corten_dns_domain::ProxyError;
use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const NAT64_PREFIX_LEN: usize = 12;

/// The high 96 bits of a DNS64 resolver's synthesis prefix.
pub type Nat64Prefix = [u8; NAT64_PREFIX_LEN];

const PROBE_QNAME: &str = "ipv4only.arpa.";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const WELL_KNOWN_ADDRS: [Ipv4Addr; 2] = [
    Ipv4Addr::new(192, 0, 0, 170),
    Ipv4Addr::new(192, 0, 0, 171),
];

/// Filters a candidate list down to well-formed IPv6 resolver addresses.
///
/// Accepted forms are bare IPv6 literals and `[literal]:port`; bare literals
/// are normalized to `[addr]:53`. IPv4 entries and URLs are rejected, and
/// duplicates are collapsed.
pub fn well_formed_candidates(entries: &[String]) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        let normalized = if entry.starts_with('[') {
            match entry.parse::<SocketAddr>() {
                Ok(addr) if addr.is_ipv6() => addr.to_string(),
                _ => {
                    debug!(entry, "rejecting malformed DNS64 candidate");
                    continue;
                }
            }
        } else if let Ok(ip) = entry.parse::<Ipv6Addr>() {
            SocketAddr::new(ip.into(), 53).to_string()
        } else {
            debug!(entry, "rejecting non-IPv6 DNS64 candidate");
            continue;
        };
        if !candidates.contains(&normalized) {
            candidates.push(normalized);
        }
    }
    candidates
}

/// Probes every candidate concurrently and returns the first discovered
/// prefix, cancelling the remaining probes. All failures are aggregated into
/// one error.
pub async fn discover(candidates: Vec<String>) -> Result<Nat64Prefix, ProxyError> {
    if candidates.is_empty() {
        return Err(ProxyError::Dns64Discovery(
            "no usable DNS64 resolvers configured".into(),
        ));
    }

    let mut probes = JoinSet::new();
    for candidate in candidates {
        probes.spawn(async move {
            let result = probe(&candidate).await;
            (candidate, result)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((candidate, Ok(prefix))) => {
                info!(resolver = %candidate, "discovered NAT64 prefix");
                probes.abort_all();
                return Ok(prefix);
            }
            Ok((candidate, Err(e))) => {
                debug!(resolver = %candidate, error = %e, "DNS64 probe failed");
                failures.push(format!("{}: {}", candidate, e));
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => failures.push(format!("probe task failed: {}", e)),
        }
    }

    Err(ProxyError::Dns64Discovery(failures.join("; ")))
}

async fn probe(candidate: &str) -> Result<Nat64Prefix, ProxyError> {
    let server: SocketAddr = candidate
        .parse()
        .map_err(|_| ProxyError::Dns64Discovery(format!("invalid resolver address '{}'", candidate)))?;

    let name = Name::from_str(PROBE_QNAME).expect("well-known probe name parses");
    let query = codec::new_query(name, RecordType::AAAA);
    let reply = udp::exchange_message(server, &query, PROBE_TIMEOUT).await?;

    extract_prefix(&reply).ok_or_else(|| {
        ProxyError::Dns64Discovery(format!("{} returned no synthesized AAAA", candidate))
    })
}

/// Pulls the NAT64 prefix out of a probe reply. Only answers embedding one of
/// the well-known addresses count; a resolver with a genuine (non-DNS64)
/// AAAA record for the probe name must not produce a prefix.
pub fn extract_prefix(reply: &Message) -> Option<Nat64Prefix> {
    for record in reply.answers() {
        if let RData::AAAA(aaaa) = record.data() {
            let octets = aaaa.0.octets();
            let embedded = Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]);
            if WELL_KNOWN_ADDRS.contains(&embedded) {
                let mut prefix = [0u8; NAT64_PREFIX_LEN];
                prefix.copy_from_slice(&octets[..NAT64_PREFIX_LEN]);
                return Some(prefix);
            }
            warn!(answer = %aaaa.0, "probe answer does not embed a well-known address");
        }
    }
    None
}

/// Embeds an IPv4 address in the prefix per RFC 6052 §2.2 (/96).
pub fn synthesize_addr(prefix: &Nat64Prefix, a: Ipv4Addr) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[..NAT64_PREFIX_LEN].copy_from_slice(prefix);
    octets[NAT64_PREFIX_LEN..].copy_from_slice(&a.octets());
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode};
    use hickory_proto::rr::rdata::AAAA;
    use hickory_proto::rr::Record;

    fn probe_reply(answer: Ipv6Addr) -> Message {
        let mut reply = Message::new();
        reply.set_id(1);
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(OpCode::Query);
        let name = Name::from_str(PROBE_QNAME).unwrap();
        reply.add_answer(Record::from_rdata(name, 600, RData::AAAA(AAAA(answer))));
        reply
    }

    #[test]
    fn candidate_filtering_matches_expected_set() {
        let entries: Vec<String> = [
            "1.1.1.1",
            "1.1.1.1:53",
            "https://dns.adguard.com",
            "[2001:67c:27e4:15::64]:53",
            "2001:67c:27e4:15::64",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let candidates = well_formed_candidates(&entries);
        assert_eq!(candidates, vec!["[2001:67c:27e4:15::64]:53".to_string()]);
    }

    #[test]
    fn bracketed_ipv4_is_rejected() {
        let entries = vec!["[1.2.3.4]:53".to_string()];
        assert!(well_formed_candidates(&entries).is_empty());
    }

    #[test]
    fn explicit_port_is_kept() {
        let entries = vec!["[2001:db8::1]:5353".to_string()];
        assert_eq!(well_formed_candidates(&entries), vec!["[2001:db8::1]:5353"]);
    }

    #[test]
    fn prefix_extraction_from_well_known_answer() {
        // 64:ff9b::/96 embedding 192.0.0.170.
        let answer: Ipv6Addr = "64:ff9b::c000:aa".parse().unwrap();
        let prefix = extract_prefix(&probe_reply(answer)).unwrap();
        let mut expected = [0u8; 12];
        expected[0] = 0x00;
        expected[1] = 0x64;
        expected[2] = 0xff;
        expected[3] = 0x9b;
        assert_eq!(prefix, expected);
    }

    #[test]
    fn genuine_aaaa_yields_no_prefix() {
        let answer: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(extract_prefix(&probe_reply(answer)).is_none());
    }

    #[test]
    fn synthesis_appends_ipv4_octets() {
        let mut prefix = [0u8; 12];
        prefix[0] = 0x00;
        prefix[1] = 0x64;
        prefix[2] = 0xff;
        prefix[3] = 0x9b;
        let addr = synthesize_addr(&prefix, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(addr.octets()[..12], prefix);
        assert_eq!(addr.octets()[12..], [8, 8, 8, 8]);
        assert_eq!(addr, "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap());
    }

    #[tokio::test]
    async fn discovery_with_no_candidates_fails() {
        assert!(matches!(
            discover(Vec::new()).await,
            Err(ProxyError::Dns64Discovery(_))
        ));
    }
}
