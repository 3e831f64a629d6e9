//! End-to-end resolver flow
//!
//! Configuration JSON → `dns::build` → `Registry` → lookups, against local
//! mock nameservers.

use std::sync::Arc;

use hickory_proto::rr::RecordType;
use rust_resolver::config::load_config_str;
use rust_resolver::dns::message::{msg_to_ip, new_query};
use rust_resolver::dns::{self, DnsError, Registry};

use super::{ip, MockServer};

async fn registry_for(json: &str) -> Arc<Registry> {
    let config = load_config_str(json).unwrap();
    let registry = Arc::new(Registry::new());
    registry.install(dns::build(&config.dns, None).unwrap());
    registry
}

// ============================================================================
// Lookups
// ============================================================================

#[tokio::test]
async fn test_lookup_through_registry() {
    let server = MockServer::start(vec![ip("93.184.216.34"), ip("2606:2800:220:1::1")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{ "nameserver": ["{}"], "ipv6": true }} }}"#,
        server.url()
    ))
    .await;

    let mut ips = registry.lookup_ip("example.com").await.unwrap();
    ips.sort();
    assert_eq!(ips, vec![ip("93.184.216.34"), ip("2606:2800:220:1::1")]);

    let v4 = registry.resolve_ipv4("example.com").await.unwrap();
    assert_eq!(v4, ip("93.184.216.34"));
    let v6 = registry.resolve_ipv6("example.com").await.unwrap();
    assert_eq!(v6, ip("2606:2800:220:1::1"));

    // A and AAAA were each fetched once, then served from cache
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_ipv6_disabled() {
    let server = MockServer::start(vec![ip("10.1.2.3")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{ "nameserver": ["{}"] }} }}"#,
        server.url()
    ))
    .await;

    let err = registry.resolve_ipv6("example.com").await.unwrap_err();
    assert!(matches!(err, DnsError::Ipv6Disabled));
    assert_eq!(registry.lookup_ip("example.com").await.unwrap(), vec![ip("10.1.2.3")]);
}

#[tokio::test]
async fn test_no_address_is_not_found() {
    let server = MockServer::start(vec![ip("10.1.2.3")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{ "nameserver": ["{}"], "ipv6": true }} }}"#,
        server.url()
    ))
    .await;

    // the server has no AAAA data
    let err = registry.resolve_ipv6("v4only.example").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_hosts_and_cache() {
    let server = MockServer::start(vec![ip("1.1.1.1")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{
            "nameserver": ["{}"],
            "hosts": {{ "nas.lan": "192.168.1.20", "+.svc.lan": ["10.0.0.9"] }}
        }} }}"#,
        server.url()
    ))
    .await;

    assert_eq!(registry.resolve_ip("nas.lan").await.unwrap(), ip("192.168.1.20"));
    assert_eq!(registry.resolve_ip("api.svc.lan").await.unwrap(), ip("10.0.0.9"));
    assert_eq!(server.hits(), 0);

    let resolver = registry.resolver().unwrap();
    let query = new_query("cached.example", RecordType::A).unwrap();
    for _ in 0..3 {
        let msg = resolver.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&msg), vec![ip("1.1.1.1")]);
    }
    assert_eq!(server.hits(), 1);

    resolver.clear_cache();
    resolver.exchange(&query).await.unwrap();
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_proxy_server_nameserver() {
    let main = MockServer::start(vec![ip("1.1.1.1")]).await;
    let proxy = MockServer::start(vec![ip("2.2.2.2")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{ "nameserver": ["{}"], "proxy-server-nameserver": ["{}"] }} }}"#,
        main.url(),
        proxy.url()
    ))
    .await;

    assert_eq!(
        registry.resolve_proxy_server_host("proxy.example").await.unwrap(),
        ip("2.2.2.2")
    );
    assert_eq!(registry.resolve_ip("other.example").await.unwrap(), ip("1.1.1.1"));
    assert_eq!(main.hits(), 1);
    assert_eq!(proxy.hits(), 1);
}

#[tokio::test]
async fn test_concurrent_lookups_coalesce() {
    let server = MockServer::start(vec![ip("8.8.4.4")]).await;
    let registry = registry_for(&format!(
        r#"{{ "dns": {{ "nameserver": ["{}"] }} }}"#,
        server.url()
    ))
    .await;

    let lookups = (0..32).map(|_| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.resolve_ipv4("burst.example").await })
    });
    for handle in futures::future::join_all(lookups).await {
        assert_eq!(handle.unwrap().unwrap(), ip("8.8.4.4"));
    }
    assert!(server.hits() <= 2, "hits = {}", server.hits());
}

// ============================================================================
// Network
// ============================================================================

#[tokio::test]
#[ignore = "requires network access"]
async fn test_public_doh_and_dot() {
    let registry = registry_for(
        r#"{ "dns": {
            "nameserver": ["https://1.1.1.1/dns-query", "tls://8.8.8.8"],
            "default-nameserver": ["223.5.5.5"]
        } }"#,
    )
    .await;
    let ips = registry.lookup_ip("example.com").await.unwrap();
    assert!(!ips.is_empty());
}
