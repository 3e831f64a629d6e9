//! Upstream backed by the operating system's nameservers (`system://`)
//!
//! The nameserver list is read from the system configuration
//! (`/etc/resolv.conf` on Unix) and kept for [`SYSTEM_DNS_FLUSH_TIME`].
//! Queries are raced over plain UDP to every listed server.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{batch_exchange, BaseClient, ClientContext, DnsClient};
use crate::dns::config::{NameServer, DEFAULT_DNS_PORT};
use crate::dns::error::{DnsError, DnsResult};

/// How long a read of the system configuration is trusted
pub const SYSTEM_DNS_FLUSH_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct State {
    refreshed: Option<Instant>,
    servers: Vec<IpAddr>,
    clients: Vec<DnsClient>,
}

/// System resolver upstream
#[derive(Default)]
pub struct SystemClient {
    state: Mutex<State>,
}

impl std::fmt::Debug for SystemClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemClient")
            .field("servers", &self.state.lock().servers)
            .finish()
    }
}

/// Unique nameserver IPs of the system configuration, in order
fn system_nameservers() -> DnsResult<Vec<IpAddr>> {
    let (config, _) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| DnsError::config(format!("read system dns config: {e}")))?;

    let mut servers: Vec<IpAddr> = Vec::new();
    for ns in config.name_servers() {
        let ip = ns.socket_addr.ip();
        if !servers.contains(&ip) {
            servers.push(ip);
        }
    }
    Ok(servers)
}

impl SystemClient {
    /// Create a client; the configuration is read on first use
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current UDP clients, re-reading the system configuration when stale
    fn clients(&self) -> DnsResult<Vec<DnsClient>> {
        let mut state = self.state.lock();
        if state
            .refreshed
            .is_some_and(|at| at.elapsed() < SYSTEM_DNS_FLUSH_TIME)
        {
            return Ok(state.clients.clone());
        }

        match system_nameservers() {
            Ok(servers) => {
                if servers != state.servers {
                    debug!(?servers, "system nameservers updated");
                    state.clients = udp_clients(&servers);
                    state.servers = servers;
                }
                state.refreshed = Some(Instant::now());
            }
            // keep serving the previous list
            Err(e) if !state.clients.is_empty() => {
                warn!(error = %e, "failed to refresh system nameservers");
            }
            Err(e) => return Err(e),
        }
        Ok(state.clients.clone())
    }

    /// Race `query` over the system nameservers
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` when the system lists no servers, or
    /// the batch error when none answers.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let clients = self.clients()?;
        if clients.is_empty() {
            return Err(DnsError::no_upstream("system has no nameserver"));
        }
        batch_exchange(&clients, query).await.map(|(msg, _)| msg)
    }
}

fn udp_clients(servers: &[IpAddr]) -> Vec<DnsClient> {
    let ctx = ClientContext::default();
    servers
        .iter()
        .filter_map(|ip| {
            let server = NameServer::udp(SocketAddr::new(*ip, DEFAULT_DNS_PORT).to_string());
            BaseClient::new(&server, &ctx)
                .map(|c| DnsClient::Base(Arc::new(c)))
                .map_err(|e| warn!(server = %ip, error = %e, "skipping system nameserver"))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_udp_clients_from_ips() {
        let clients = udp_clients(&[
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            "2001:db8::1".parse().unwrap(),
        ]);
        let addrs: Vec<String> = clients.iter().map(DnsClient::address).collect();
        assert_eq!(addrs, vec!["udp://10.0.0.1:53", "udp://[2001:db8::1]:53"]);
    }

    #[test]
    fn test_clients_cached_within_flush_time() {
        let client = SystemClient::new();
        {
            let mut state = client.state.lock();
            state.refreshed = Some(Instant::now());
            state.servers = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
            state.clients = udp_clients(&state.servers);
        }
        let clients = client.clients().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].address(), "udp://127.0.0.1:53");
    }

    #[tokio::test]
    async fn test_empty_list_is_no_upstream() {
        let client = SystemClient::new();
        client.state.lock().refreshed = Some(Instant::now());

        let query = crate::dns::message::new_query("example.com", hickory_proto::rr::RecordType::A)
            .unwrap();
        let err = client.exchange(&query).await.unwrap_err();
        assert!(matches!(err, DnsError::NoUpstream { .. }));
    }
}
