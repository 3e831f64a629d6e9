//! Fake-IP persistence across restarts
//!
//! A persistent pool must hand out the same address for a host after being
//! rebuilt from the same database, and continue allocation where it stopped.

use std::net::IpAddr;

use hickory_proto::rr::RecordType;
use rust_resolver::config::load_config_str;
use rust_resolver::dns::message::{msg_to_ip, new_query};
use rust_resolver::dns::{self, Registry};
use rust_resolver::fakeip::{Pool, PoolOptions};
use serde_json::json;

use super::{ip, MockServer};

#[test]
fn test_pool_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("fakeip.db");
    let net = "198.18.0.0/24".parse().unwrap();

    let (a, b) = {
        let pool = Pool::new(PoolOptions::new(net).with_persistence(&db)).unwrap();
        let a = pool.lookup("a.example");
        let b = pool.lookup("b.example");
        pool.store_state();
        (a, b)
    };

    let pool = Pool::new(PoolOptions::new(net).with_persistence(&db)).unwrap();
    assert_eq!(pool.lookup("a.example"), a);
    assert_eq!(pool.look_back(b).as_deref(), Some("b.example"));

    let c = pool.lookup("c.example");
    assert_ne!(c, a);
    assert_ne!(c, b);
}

#[test]
fn test_small_pool_cycles() {
    let pool = Pool::new(PoolOptions::new("198.18.0.0/29".parse().unwrap())).unwrap();
    let first = pool.lookup("h0.example");
    let hosts: Vec<IpAddr> = (1..4).map(|i| pool.lookup(&format!("h{i}.example"))).collect();
    assert!(!hosts.contains(&first));

    // wrapped: the oldest binding is evicted
    let wrapped = pool.lookup("h4.example");
    assert_eq!(wrapped, first);
    assert!(pool.look_back(first).as_deref() == Some("h4.example"));
}

#[tokio::test]
async fn test_fake_ip_mode_through_registry() {
    let upstream = MockServer::start(vec![ip("192.168.1.20")]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_str(
        &json!({
            "dns": {
                "nameserver": [upstream.url()],
                "enhanced-mode": "fake-ip",
                "fake-ip-range": "198.18.0.1/16",
                "fake-ip-filter": ["+.lan"],
                "store-fake-ip": true,
                "fake-ip-store-path": dir.path().join("fakeip.db")
            }
        })
        .to_string(),
    )
    .unwrap();

    let registry = Registry::new();
    registry.install(dns::build(&config.dns, None).unwrap());

    let answer = registry.exchange(&new_query("video.example", RecordType::A).unwrap()).await.unwrap();
    let fake = msg_to_ip(&answer)[0];
    assert!(registry.is_fake_ip(fake));
    assert_eq!(registry.find_host_by_ip(fake).as_deref(), Some("video.example"));
    assert_eq!(upstream.hits(), 0);

    // filtered names get their real address
    let answer = registry.exchange(&new_query("nas.lan", RecordType::A).unwrap()).await.unwrap();
    assert_eq!(msg_to_ip(&answer), vec![ip("192.168.1.20")]);
    assert_eq!(upstream.hits(), 1);

    // reload with the same store keeps the binding
    registry.install(dns::build(&config.dns, None).unwrap());
    assert_eq!(registry.find_host_by_ip(fake).as_deref(), Some("video.example"));
    let answer = registry.exchange(&new_query("video.example", RecordType::A).unwrap()).await.unwrap();
    assert_eq!(msg_to_ip(&answer), vec![fake]);
}

#[tokio::test]
async fn test_mapping_mode_records_real_addresses() {
    let upstream = MockServer::start(vec![ip("93.184.216.34")]).await;
    let config = load_config_str(
        &json!({
            "dns": {
                "nameserver": [upstream.url()],
                "enhanced-mode": "redir-host"
            }
        })
        .to_string(),
    )
    .unwrap();

    let registry = Registry::new();
    registry.install(dns::build(&config.dns, None).unwrap());

    let answer = registry.exchange(&new_query("example.com", RecordType::A).unwrap()).await.unwrap();
    assert_eq!(msg_to_ip(&answer), vec![ip("93.184.216.34")]);
    assert!(!registry.is_fake_ip(ip("93.184.216.34")));
    assert_eq!(registry.find_host_by_ip(ip("93.184.216.34")).as_deref(), Some("example.com"));
}
