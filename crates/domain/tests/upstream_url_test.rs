use corten_dns_domain::{UpstreamAddr, UpstreamUrl};

#[test]
fn parses_mixed_upstream_set() {
    let urls = [
        "tls://1.1.1.1",
        "https://dns.cloudflare.com/dns-query",
        "tls://dns.adguard.com",
        "https://dns.adguard.com/dns-query",
        "176.103.130.130",
        "sdns://AQIAAAAAAAAAFDE3Ni4xMDMuMTMwLjEzMDo1NDQz",
    ];
    let parsed: Vec<UpstreamUrl> = urls.iter().map(|u| u.parse().unwrap()).collect();

    assert!(matches!(parsed[0], UpstreamUrl::Tls { .. }));
    assert!(matches!(parsed[1], UpstreamUrl::Https { .. }));
    assert!(matches!(parsed[4], UpstreamUrl::Udp { .. }));
    assert!(matches!(parsed[5], UpstreamUrl::DnsCrypt { .. }));
}

#[test]
fn tls_with_ip_is_resolved() {
    let url: UpstreamUrl = "tls://1.1.1.1".parse().unwrap();
    match url {
        UpstreamUrl::Tls { addr, .. } => {
            assert_eq!(addr.socket_addr().unwrap(), "1.1.1.1:853".parse().unwrap());
        }
        other => panic!("expected tls, got {:?}", other),
    }
}

#[test]
fn hostname_resolution_substitutes_ip() {
    let url: UpstreamUrl = "tcp://dns.example.org:5353".parse().unwrap();
    assert!(url.needs_resolution());

    let resolved = url.with_resolved_ip("10.0.0.1".parse().unwrap());
    assert!(!resolved.needs_resolution());
    assert_eq!(
        resolved.addr().unwrap().socket_addr().unwrap(),
        "10.0.0.1:5353".parse().unwrap()
    );
}

#[test]
fn unresolved_display_keeps_hostname() {
    let addr = UpstreamAddr::Unresolved {
        hostname: "dns.example.org".into(),
        port: 853,
    };
    assert_eq!(addr.to_string(), "dns.example.org:853");
}
