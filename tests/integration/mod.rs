//! Integration tests for rust-resolver
//!
//! # Test Organization
//!
//! - `resolver_flow`: configuration → build → registry → lookups against mock servers
//! - `policy_routing`: nameserver policies, rule-sets and fallback filtering
//! - `fakeip_persist`: fake-IP pool persistence across restarts
//!
//! # Test Requirements
//!
//! - Mock DNS servers listen on `127.0.0.1:0`; no network access is needed
//! - Tests marked with `#[ignore]` query public resolvers

pub mod fakeip_persist;
pub mod policy_routing;
pub mod resolver_flow;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::net::UdpSocket;

/// A mock UDP nameserver answering A/AAAA with fixed addresses
pub struct MockServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl MockServer {
    /// Start a server answering with `ips` (family-filtered per question)
    pub async fn start(ips: Vec<IpAddr>) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(query) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                let reply = answer(&query, &ips);
                let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        });

        Self { addr, hits }
    }

    /// Nameserver URL for configuration
    pub fn url(&self) -> String {
        format!("udp://{}", self.addr)
    }

    /// Queries received so far
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn answer(query: &Message, ips: &[IpAddr]) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(query.queries().to_vec());

    if let Some(q) = query.queries().first() {
        for ip in ips {
            let rdata = match (q.query_type(), ip) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A(*v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            reply.add_answer(Record::from_rdata(q.name().clone(), 60, rdata));
        }
    }
    reply
}

/// Parse a literal address
pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}
