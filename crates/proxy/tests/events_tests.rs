//! Event-sink behavior gets its own test binary: the listener slot is
//! process-wide, so these tests install one collector and filter by qname.

mod helpers;

use corten_dns_domain::RawConfig;
use corten_dns_proxy::{set_listener, ProcessedEvent, ProcessedEventListener, Proxy};
use helpers::mock_dns_server::{MockBehavior, MockDnsServer};
use helpers::{make_query, udp_exchange};
use hickory_proto::rr::RecordType;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

struct Collector(Mutex<Vec<ProcessedEvent>>);

impl ProcessedEventListener for Collector {
    fn request_processed(&self, event: &ProcessedEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn collector() -> &'static Arc<Collector> {
    static COLLECTOR: OnceLock<Arc<Collector>> = OnceLock::new();
    COLLECTOR.get_or_init(|| {
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        set_listener(Some(collector.clone()));
        collector
    })
}

fn events_for(qname: &str) -> Vec<ProcessedEvent> {
    collector()
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.qname.eq_ignore_ascii_case(qname))
        .cloned()
        .collect()
}

async fn start_proxy(upstream: &MockDnsServer, ratelimit: u32) -> Proxy {
    let raw = RawConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        upstreams: upstream.addr().to_string(),
        timeout_ms: 2000,
        ratelimit,
        ..Default::default()
    };
    let proxy = Proxy::new(raw.parse().unwrap());
    proxy.start().await.unwrap();
    proxy
}

#[tokio::test]
async fn one_event_per_processed_request() {
    let upstream = MockDnsServer::start(MockBehavior::StaticA(Ipv4Addr::new(8, 8, 8, 8)))
        .await
        .unwrap();
    let proxy = start_proxy(&upstream, 0).await;

    let request = make_query("events-single.example", RecordType::A);
    udp_exchange(proxy.addr().await.unwrap(), &request, Duration::from_secs(2))
        .await
        .expect("expected a reply");

    // Emission happens on the handler task; allow it to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = events_for("events-single.example.");
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.qtype, u16::from(RecordType::A));
    assert!(event.answer.contains("8.8.8.8"), "answer was '{}'", event.answer);
    // Bare-address upstream config normalizes to the udp:// URL form.
    assert_eq!(event.upstream_addr, format!("udp://{}", upstream.addr()));
    assert!(event.error.is_empty());

    proxy.stop().await.unwrap();
    upstream.shutdown();
}

#[tokio::test]
async fn rate_limited_request_emits_no_event() {
    let upstream = MockDnsServer::start(MockBehavior::StaticA(Ipv4Addr::new(8, 8, 8, 8)))
        .await
        .unwrap();
    let proxy = start_proxy(&upstream, 1).await;
    let addr = proxy.addr().await.unwrap();

    let first = make_query("events-limited.example", RecordType::A);
    udp_exchange(addr, &first, Duration::from_secs(2))
        .await
        .expect("first reply");

    let second = make_query("events-limited.example", RecordType::A);
    assert!(udp_exchange(addr, &second, Duration::from_millis(400)).await.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        events_for("events-limited.example.").len(),
        1,
        "the dropped request must not emit an event"
    );

    proxy.stop().await.unwrap();
    upstream.shutdown();
}

#[tokio::test]
async fn failed_exchange_event_carries_error_text() {
    let upstream = MockDnsServer::start(MockBehavior::Silent).await.unwrap();
    let raw = RawConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        upstreams: upstream.addr().to_string(),
        timeout_ms: 200,
        ..Default::default()
    };
    let proxy = Proxy::new(raw.parse().unwrap());
    proxy.start().await.unwrap();

    let request = make_query("events-failing.example", RecordType::A);
    let reply = udp_exchange(proxy.addr().await.unwrap(), &request, Duration::from_secs(3))
        .await
        .expect("SERVFAIL still gets written");
    assert_eq!(reply.response_code(), hickory_proto::op::ResponseCode::ServFail);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = events_for("events-failing.example.");
    assert_eq!(events.len(), 1);
    assert!(!events[0].error.is_empty(), "event must carry the upstream error");

    proxy.stop().await.unwrap();
    upstream.shutdown();
}

#[tokio::test]
async fn resolve_calls_emit_events_too() {
    let upstream = MockDnsServer::start(MockBehavior::StaticA(Ipv4Addr::new(8, 8, 8, 8)))
        .await
        .unwrap();
    let proxy = start_proxy(&upstream, 0).await;

    const CALLS: usize = 3;
    for _ in 0..CALLS {
        let request = make_query("events-resolve.example", RecordType::A);
        proxy.resolve(&request.to_vec().unwrap()).await.unwrap();
    }

    assert_eq!(events_for("events-resolve.example.").len(), CALLS);

    proxy.stop().await.unwrap();
    upstream.shutdown();
}
