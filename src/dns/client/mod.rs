//! Upstream DNS clients
//!
//! Every upstream is a [`DnsClient`]: one `exchange(query) -> response`
//! contract over a closed set of transports.
//!
//! # Transports
//!
//! | Variant  | Wire                                        |
//! |----------|---------------------------------------------|
//! | `Base`   | UDP (TCP on truncation), TCP, TLS           |
//! | `Doh`    | DNS over HTTPS: HTTP/1.1, HTTP/2, HTTP/3    |
//! | `Doq`    | DNS over QUIC                               |
//! | `Dhcp`   | UDP to servers learned by DHCP              |
//! | `System` | UDP to the operating system's resolvers     |
//! | `Rcode`  | no wire: a fixed response code             |
//!
//! # Racing
//!
//! [`batch_exchange`] sends the query to every client of a group at once and
//! keeps the first usable answer. The remaining futures are dropped.
//!
//! # Example
//!
//! ```no_run
//! use rust_resolver::dns::client::{batch_exchange, transform, ClientContext};
//! use rust_resolver::dns::message::new_query;
//! use rust_resolver::dns::parse_nameservers;
//! use hickory_proto::rr::RecordType;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let servers = parse_nameservers(&["8.8.8.8".into(), "tls://1.1.1.1".into()], false, false)?;
//! let clients = transform(&servers, &ClientContext::default());
//!
//! let query = new_query("example.com", RecordType::A)?;
//! let (response, cacheable) = batch_exchange(&clients, &query).await?;
//! println!("{} answers, cacheable={cacheable}", response.answers().len());
//! # Ok(())
//! # }
//! ```

mod base;
mod dhcp;
mod doh;
mod doq;
mod quic;
mod rcode;
mod slot;
mod system;
mod tls;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use tokio::time::timeout;
use tracing::{debug, warn};

pub use base::BaseClient;
pub use dhcp::DhcpClient;
pub use doh::DohClient;
pub use doq::DoqClient;
pub use rcode::{RcodeClient, RCODE_NAMES};
pub use system::SystemClient;

use super::config::{NameServer, NameServerNet};
use super::dialer::Dispatcher;
use super::error::{DnsError, DnsResult};
use super::resolver::Resolver;
use super::DEFAULT_DNS_TIMEOUT;

/// Maximum DNS message size over TCP (2-byte length prefix)
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// Receive buffer for UDP responses
pub const UDP_BUFFER_SIZE: usize = 4096;

/// What clients need from their surroundings to dial
#[derive(Clone, Default)]
pub struct ClientContext {
    /// Resolves upstream hostnames (the default-nameserver resolver)
    pub resolver: Option<Resolver>,
    /// Rule engine and proxy registry for proxied upstreams
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("resolver", &self.resolver.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

/// One upstream
#[derive(Clone)]
pub enum DnsClient {
    /// UDP, TCP or TLS
    Base(Arc<BaseClient>),
    /// DNS over HTTPS
    Doh(Arc<DohClient>),
    /// DNS over QUIC
    Doq(Arc<DoqClient>),
    /// DHCP-discovered servers
    Dhcp(Arc<DhcpClient>),
    /// Operating system resolvers
    System(Arc<SystemClient>),
    /// Static response code
    Rcode(Arc<RcodeClient>),
}

impl fmt::Debug for DnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DnsClient").field(&self.address()).finish()
    }
}

impl DnsClient {
    /// Send `query` and wait for the answer
    ///
    /// Boxed: DHCP and system clients race nested groups, and socket clients
    /// may resolve their server through a resolver built from clients.
    pub fn exchange<'a>(&'a self, query: &'a Message) -> BoxFuture<'a, DnsResult<Message>> {
        Box::pin(async move {
            match self {
                Self::Base(c) => c.exchange(query).await,
                Self::Doh(c) => c.exchange(query).await,
                Self::Doq(c) => c.exchange(query).await,
                Self::Dhcp(c) => c.exchange(query).await,
                Self::System(c) => c.exchange(query).await,
                Self::Rcode(c) => Ok(c.exchange(query)),
            }
        })
    }

    /// Display address, e.g. `udp://8.8.8.8:53`
    #[must_use]
    pub fn address(&self) -> String {
        match self {
            Self::Base(c) => c.address(),
            Self::Doh(c) => c.address().to_owned(),
            Self::Doq(c) => c.address(),
            Self::Dhcp(c) => c.address(),
            Self::System(_) => "system".to_owned(),
            Self::Rcode(c) => c.address(),
        }
    }

    /// Drop any cached connection (DoH and DoQ)
    pub async fn reset_connection(&self) {
        match self {
            Self::Doh(c) => c.reset_connection().await,
            Self::Doq(c) => c.reset_connection().await,
            _ => {}
        }
    }

    /// Whether this client answers without contacting anyone
    #[must_use]
    pub fn is_rcode(&self) -> bool {
        matches!(self, Self::Rcode(_))
    }
}

/// Build clients for the configured servers
///
/// Servers whose client cannot be built are logged and skipped.
#[must_use]
pub fn transform(servers: &[NameServer], ctx: &ClientContext) -> Vec<DnsClient> {
    let mut clients = Vec::with_capacity(servers.len());
    for server in servers {
        let client = match server.net {
            NameServerNet::Udp | NameServerNet::Tcp | NameServerNet::Tls => {
                BaseClient::new(server, ctx).map(|c| DnsClient::Base(Arc::new(c)))
            }
            NameServerNet::Https => DohClient::new(server, ctx).map(|c| DnsClient::Doh(Arc::new(c))),
            NameServerNet::Quic => DoqClient::new(server, ctx).map(|c| DnsClient::Doq(Arc::new(c))),
            NameServerNet::Dhcp => Ok(DnsClient::Dhcp(Arc::new(DhcpClient::new(&server.addr)))),
            NameServerNet::System => Ok(DnsClient::System(Arc::new(SystemClient::new()))),
            NameServerNet::Rcode => {
                RcodeClient::new(&server.addr).map(|c| DnsClient::Rcode(Arc::new(c)))
            }
        };
        match client {
            Ok(client) => clients.push(client),
            Err(e) => warn!(server = %server, error = %e, "skipping nameserver"),
        }
    }
    clients
}

/// Race `query` across `clients`
///
/// Returns the first successful answer and whether it may be cached. An
/// rcode client answers immediately and is never cacheable. SERVFAIL and
/// REFUSED answers count as failures.
///
/// # Errors
///
/// - `DnsError::NoUpstream` for an empty group
/// - `DnsError::AllFailed` carrying the first error when every client failed
/// - `DnsError::TimeoutError` when nothing answered within the default timeout
pub async fn batch_exchange(clients: &[DnsClient], query: &Message) -> DnsResult<(Message, bool)> {
    if let Some(rcode) = clients.iter().find(|c| c.is_rcode()) {
        return rcode.exchange(query).await.map(|m| (m, false));
    }
    if clients.is_empty() {
        return Err(DnsError::no_upstream("empty nameserver group"));
    }

    let mut pending: FuturesUnordered<_> = clients
        .iter()
        .map(|client| async move { (client.address(), client.exchange(query).await) })
        .collect();

    let mut first_error: Option<DnsError> = None;
    let raced = timeout(DEFAULT_DNS_TIMEOUT, async {
        while let Some((upstream, result)) = pending.next().await {
            match result {
                Ok(response)
                    if matches!(
                        response.response_code(),
                        ResponseCode::ServFail | ResponseCode::Refused
                    ) =>
                {
                    let rcode = response.response_code();
                    debug!(upstream = %upstream, rcode = %rcode, "upstream refused query");
                    first_error.get_or_insert_with(|| {
                        DnsError::upstream_rcode(&upstream, "server failure", u16::from(rcode))
                    });
                }
                Ok(response) => {
                    debug!(upstream = %upstream, answers = response.answers().len(), "upstream answered");
                    return Some(response);
                }
                Err(e) => {
                    debug!(upstream = %upstream, error = %e, "upstream exchange failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        None
    })
    .await;

    match raced {
        Ok(Some(response)) => Ok((response, true)),
        Ok(None) => Err(DnsError::all_failed(
            first_error.unwrap_or_else(|| DnsError::no_upstream("no answer")),
        )),
        Err(_) => Err(first_error.map_or_else(
            || DnsError::timeout("batch exchange", DEFAULT_DNS_TIMEOUT),
            DnsError::all_failed,
        )),
    }
}

/// Check that `response` answers `query`
///
/// The ID and the first question's name, type and class must match.
#[must_use]
pub fn validate_response(query: &Message, response: &Message) -> bool {
    if query.id() != response.id() {
        return false;
    }

    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use hickory_proto::rr::RecordType;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::dns::message::{msg_to_ip, new_query, reply_with_ips, reply_with_rcode};

    // ========================================================================
    // Helper Functions
    // ========================================================================

    /// Mock UDP DNS server answering every query with `ip`
    pub(crate) async fn mock_udp_server(
        ip: IpAddr,
        delay: Duration,
        rcode: Option<ResponseCode>,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let socket = Arc::new(socket);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(query) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                let socket = socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let reply = match rcode {
                        Some(rcode) => reply_with_rcode(&query, rcode),
                        None => reply_with_ips(&query, &[ip], 60),
                    };
                    let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
                });
            }
        });
        (addr, hits)
    }

    pub(crate) fn udp_client(addr: SocketAddr) -> DnsClient {
        let server = NameServer::udp(addr.to_string());
        transform(&[server], &ClientContext::default()).remove(0)
    }

    // ========================================================================
    // batch_exchange
    // ========================================================================

    #[tokio::test]
    async fn test_batch_first_success_wins() {
        let fast_ip = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let slow_ip = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
        let (fast, _) = mock_udp_server(fast_ip, Duration::ZERO, None).await;
        let (slow, _) = mock_udp_server(slow_ip, Duration::from_millis(300), None).await;

        let clients = vec![udp_client(slow), udp_client(fast)];
        let query = new_query("example.com", RecordType::A).unwrap();
        let (response, cacheable) = batch_exchange(&clients, &query).await.unwrap();
        assert!(cacheable);
        assert_eq!(msg_to_ip(&response), vec![fast_ip]);
    }

    #[tokio::test]
    async fn test_batch_servfail_is_failure() {
        let ip = IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3));
        let (bad, _) = mock_udp_server(ip, Duration::ZERO, Some(ResponseCode::ServFail)).await;
        let (good, _) = mock_udp_server(ip, Duration::from_millis(50), None).await;

        let query = new_query("example.com", RecordType::A).unwrap();
        let (response, _) = batch_exchange(&[udp_client(bad), udp_client(good)], &query)
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);

        let err = batch_exchange(&[udp_client(bad)], &query).await.unwrap_err();
        assert!(matches!(err, DnsError::AllFailed { .. }));
    }

    #[tokio::test]
    async fn test_batch_rcode_short_circuits() {
        let (addr, hits) =
            mock_udp_server(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::ZERO, None).await;
        let rcode = transform(
            &[NameServer::new(NameServerNet::Rcode, "refused")],
            &ClientContext::default(),
        )
        .remove(0);

        let query = new_query("blocked.example", RecordType::A).unwrap();
        let (response, cacheable) = batch_exchange(&[udp_client(addr), rcode], &query)
            .await
            .unwrap();
        assert!(!cacheable);
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_empty_group() {
        let query = new_query("example.com", RecordType::A).unwrap();
        let err = batch_exchange(&[], &query).await.unwrap_err();
        assert!(matches!(err, DnsError::NoUpstream { .. }));
    }

    // ========================================================================
    // validate_response / transform
    // ========================================================================

    #[test]
    fn test_validate_response() {
        let query = new_query("example.com", RecordType::A).unwrap();
        let reply = reply_with_rcode(&query, ResponseCode::NoError);
        assert!(validate_response(&query, &reply));

        let mut wrong_id = reply.clone();
        wrong_id.set_id(query.id().wrapping_add(1));
        assert!(!validate_response(&query, &wrong_id));

        let other = new_query("example.org", RecordType::A).unwrap();
        let mut wrong_name = reply_with_rcode(&other, ResponseCode::NoError);
        wrong_name.set_id(query.id());
        assert!(!validate_response(&query, &wrong_name));
    }

    #[test]
    fn test_transform_skips_bad_servers() {
        let servers = vec![
            NameServer::udp("8.8.8.8:53"),
            NameServer::new(NameServerNet::Rcode, "teapot"),
            NameServer::new(NameServerNet::Tls, "1.1.1.1:853"),
        ];
        let clients = transform(&servers, &ClientContext::default());
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].address(), "udp://8.8.8.8:53");
        assert_eq!(clients[1].address(), "tls://1.1.1.1:853");
    }
}
