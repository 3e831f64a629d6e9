//! Nameserver policy and fallback routing
//!
//! Verifies which upstream answers for a domain given `nameserver-policy`,
//! rule-set files, GeoSite lists and `fallback-filter`.

use std::io::Write;

use rust_resolver::config::load_config_str;
use rust_resolver::dns::{self, Resolver};
use serde_json::json;

use super::{ip, MockServer};

fn build(dns: serde_json::Value) -> Resolver {
    let config = load_config_str(&json!({ "dns": dns }).to_string()).unwrap();
    dns::build(&config.dns, None).unwrap().resolver
}

// ============================================================================
// Policies
// ============================================================================

#[tokio::test]
async fn test_policy_order_and_rule_set() {
    let main = MockServer::start(vec![ip("1.0.0.1")]).await;
    let corp = MockServer::start(vec![ip("10.0.0.1")]).await;
    let media = MockServer::start(vec![ip("10.0.0.2")]).await;

    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("media.txt");
    let mut file = std::fs::File::create(&list).unwrap();
    writeln!(file, "# streaming").unwrap();
    writeln!(file, "+.video.example").unwrap();
    writeln!(file, "cdn.*.example").unwrap();

    let resolver = build(json!({
        "nameserver": [main.url()],
        "nameserver-policy": [
            { "domain": "+.corp.example, intranet.example", "nameserver": [corp.url()] },
            { "domain": "rule-set:media", "nameserver": [media.url()] },
            { "domain": "+.video.example", "nameserver": [corp.url()] }
        ],
        "rule-sets": { "media": list }
    }));

    assert_eq!(resolver.resolve_ipv4("git.corp.example").await.unwrap(), ip("10.0.0.1"));
    assert_eq!(resolver.resolve_ipv4("intranet.example").await.unwrap(), ip("10.0.0.1"));
    // the rule-set precedes the later trie entry
    assert_eq!(resolver.resolve_ipv4("www.video.example").await.unwrap(), ip("10.0.0.2"));
    assert_eq!(resolver.resolve_ipv4("cdn.eu.example").await.unwrap(), ip("10.0.0.2"));
    assert_eq!(resolver.resolve_ipv4("public.example").await.unwrap(), ip("1.0.0.1"));
    assert_eq!(main.hits(), 1);
}

#[tokio::test]
async fn test_rcode_policy_blocks() {
    let main = MockServer::start(vec![ip("1.0.0.1")]).await;
    let resolver = build(json!({
        "nameserver": [main.url()],
        "nameserver-policy": [
            { "domain": "+.ads.example", "nameserver": ["rcode://name_error"] }
        ]
    }));

    let err = resolver.lookup_ipv4("track.ads.example").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(main.hits(), 0);
}

#[tokio::test]
async fn test_geosite_policy() {
    let main = MockServer::start(vec![ip("1.0.0.1")]).await;
    let domestic = MockServer::start(vec![ip("114.114.114.114")]).await;

    let dir = tempfile::tempdir().unwrap();
    let cn = dir.path().join("cn.txt");
    std::fs::write(&cn, "domain:baidu.com\nfull:qq.com\nkeyword:taobao\n").unwrap();

    let resolver = build(json!({
        "nameserver": [main.url()],
        "nameserver-policy": [
            { "domain": "geosite:cn", "nameserver": [domestic.url()] }
        ],
        "geosite": { "cn": cn }
    }));

    assert_eq!(resolver.resolve_ipv4("www.baidu.com").await.unwrap(), ip("114.114.114.114"));
    assert_eq!(resolver.resolve_ipv4("qq.com").await.unwrap(), ip("114.114.114.114"));
    assert_eq!(resolver.resolve_ipv4("www.qq.com").await.unwrap(), ip("1.0.0.1"));
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_local_answer_never_queries_fallback() {
    let main = MockServer::start(vec![ip("114.114.114.114")]).await;
    let fallback = MockServer::start(vec![ip("8.8.8.8")]).await;
    let resolver = build(json!({
        "nameserver": [main.url()],
        "fallback": [fallback.url()],
        "fallback-filter": { "ipcidr": ["240.0.0.0/4", "0.0.0.0/32"] }
    }));

    for _ in 0..3 {
        assert_eq!(resolver.resolve_ipv4("local.example").await.unwrap(), ip("114.114.114.114"));
    }
    assert_eq!(fallback.hits(), 0);
}

#[tokio::test]
async fn test_any_suspect_address_uses_fallback() {
    let main = MockServer::start(vec![ip("114.114.114.114"), ip("240.1.2.3")]).await;
    let fallback = MockServer::start(vec![ip("8.8.8.8")]).await;
    let resolver = build(json!({
        "nameserver": [main.url()],
        "fallback": [fallback.url()],
        "fallback-filter": { "ipcidr": ["240.0.0.0/4"] }
    }));

    assert_eq!(resolver.lookup_ipv4("mixed.example").await.unwrap(), vec![ip("8.8.8.8")]);
    assert_eq!(fallback.hits(), 1);
}

#[tokio::test]
async fn test_fallback_domain_filter() {
    let main = MockServer::start(vec![ip("114.114.114.114")]).await;
    let fallback = MockServer::start(vec![ip("8.8.8.8")]).await;
    let resolver = build(json!({
        "nameserver": [main.url()],
        "fallback": [fallback.url()],
        "fallback-filter": { "domain": ["+.google.com"] }
    }));

    assert_eq!(resolver.resolve_ipv4("www.google.com").await.unwrap(), ip("8.8.8.8"));
    assert_eq!(resolver.resolve_ipv4("baidu.com").await.unwrap(), ip("114.114.114.114"));
    assert_eq!(main.hits(), 1);
    assert_eq!(fallback.hits(), 1);
}
