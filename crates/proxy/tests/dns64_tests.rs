mod helpers;

use corten_dns_domain::RawConfig;
use corten_dns_proxy::{dns64, Proxy};
use helpers::mock_dns_server::{MockBehavior, MockDnsServer};
use helpers::{make_query, udp_exchange};
use hickory_proto::rr::{RData, RecordType};
use std::net::Ipv4Addr;
use std::time::Duration;

fn test_prefix() -> [u8; 12] {
    let mut prefix = [0u8; 12];
    prefix[0] = 0x00;
    prefix[1] = 0x64;
    prefix[2] = 0xff;
    prefix[3] = 0x9b;
    prefix
}

async fn dns64_resolver() -> MockDnsServer {
    MockDnsServer::start_on(
        "[::1]:0",
        MockBehavior::Dns64 {
            prefix: test_prefix(),
            a: Ipv4Addr::new(8, 8, 8, 8),
        },
    )
    .await
    .expect("IPv6 loopback must be available for DNS64 tests")
}

#[tokio::test]
async fn probe_discovers_prefix() {
    let resolver = dns64_resolver().await;
    let candidate = resolver.addr().to_string();

    let prefix = dns64::discover(vec![candidate]).await.unwrap();
    assert_eq!(prefix, test_prefix());

    resolver.shutdown();
}

#[tokio::test]
async fn discovery_returns_first_success_among_candidates() {
    let resolver = dns64_resolver().await;
    // A plain resolver that answers the probe with no synthesized AAAA.
    let plain = MockDnsServer::start_on("[::1]:0", MockBehavior::StaticA(Ipv4Addr::new(1, 1, 1, 1)))
        .await
        .unwrap();

    let candidates = vec![plain.addr().to_string(), resolver.addr().to_string()];
    let prefix = dns64::discover(candidates).await.unwrap();
    assert_eq!(prefix, test_prefix());

    resolver.shutdown();
    plain.shutdown();
}

#[tokio::test]
async fn discovery_aggregates_total_failure() {
    let plain = MockDnsServer::start_on("[::1]:0", MockBehavior::StaticA(Ipv4Addr::new(1, 1, 1, 1)))
        .await
        .unwrap();
    let result = dns64::discover(vec![plain.addr().to_string()]).await;
    assert!(result.is_err());
    plain.shutdown();
}

#[tokio::test]
async fn aaaa_answers_are_synthesized_end_to_end() {
    let resolver = dns64_resolver().await;
    // The regular upstream serves A records only.
    let upstream = MockDnsServer::start(MockBehavior::StaticA(Ipv4Addr::new(8, 8, 8, 8)))
        .await
        .unwrap();

    let raw = RawConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        upstreams: upstream.addr().to_string(),
        dns64_upstreams: resolver.addr().to_string(),
        timeout_ms: 2000,
        ..Default::default()
    };
    let proxy = Proxy::new(raw.parse().unwrap());
    proxy.start().await.unwrap();

    // Wait for background discovery to store the prefix.
    let mut discovered = false;
    for _ in 0..50 {
        if proxy.nat64_prefix_discovered().await {
            discovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(discovered, "NAT64 prefix discovery did not complete");

    let request = make_query("and.ru", RecordType::AAAA);
    let reply = udp_exchange(proxy.addr().await.unwrap(), &request, Duration::from_secs(2))
        .await
        .expect("expected a reply");

    let aaaa: Vec<_> = reply
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::AAAA(aaaa) => Some(aaaa.0),
            _ => None,
        })
        .collect();
    assert!(!aaaa.is_empty(), "expected at least one synthesized AAAA");
    for addr in aaaa {
        assert_eq!(addr.octets()[..12], test_prefix());
        assert_eq!(addr.octets()[12..], [8, 8, 8, 8]);
    }

    proxy.stop().await.unwrap();
    upstream.shutdown();
    resolver.shutdown();
}

#[tokio::test]
async fn a_queries_are_untouched_by_dns64() {
    let resolver = dns64_resolver().await;
    let upstream = MockDnsServer::start(MockBehavior::StaticA(Ipv4Addr::new(8, 8, 8, 8)))
        .await
        .unwrap();

    let raw = RawConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        upstreams: upstream.addr().to_string(),
        dns64_upstreams: resolver.addr().to_string(),
        timeout_ms: 2000,
        ..Default::default()
    };
    let proxy = Proxy::new(raw.parse().unwrap());
    proxy.start().await.unwrap();

    let request = make_query("and.ru", RecordType::A);
    let reply = udp_exchange(proxy.addr().await.unwrap(), &request, Duration::from_secs(2))
        .await
        .expect("expected a reply");

    assert_eq!(reply.answers().len(), 1);
    assert!(matches!(reply.answers()[0].data(), RData::A(_)));

    proxy.stop().await.unwrap();
    upstream.shutdown();
    resolver.shutdown();
}
