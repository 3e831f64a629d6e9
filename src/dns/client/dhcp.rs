//! Upstream whose servers are learned by DHCP on an interface (`dhcp://<iface>`)
//!
//! # Lifecycle
//!
//! ```text
//! exchange ──▶ invalidate? ──yes──▶ spawn discovery (DHCPDISCOVER, 1 min budget)
//!                 │                        │
//!                 no                       ▼
//!                 │               clients / error stored
//!                 ▼                        │
//!          wait while nothing is known ◀───┘
//!                 │
//!                 ▼
//!          batch_exchange over UDP clients bound to the interface
//! ```
//!
//! The interface address is checked at most every [`IFACE_TTL`]; a new
//! discovery runs when the address changed or [`DHCP_TTL`] elapsed. Until a
//! discovery finishes, the previous result keeps being served.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{batch_exchange, transform, ClientContext, DnsClient};
use crate::dns::config::{NameServer, DEFAULT_DNS_PORT};
use crate::dns::dialer::bind_device;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::DEFAULT_DNS_TIMEOUT;

/// Minimum interval between interface address checks
pub const IFACE_TTL: Duration = Duration::from_secs(20);

/// Lifetime of a discovered server list
pub const DHCP_TTL: Duration = Duration::from_secs(60 * 60);

/// Budget of one discovery
pub const DHCP_TIMEOUT: Duration = Duration::from_secs(60);

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// Fixed BOOTP header length before the magic cookie
const BOOTP_HEADER_LEN: usize = 236;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_DOMAIN_NAME: u8 = 15;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_END: u8 = 255;

const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;
const DHCPACK: u8 = 5;

#[derive(Default)]
struct State {
    iface_invalidate: Option<Instant>,
    dns_invalidate: Option<Instant>,
    iface_ip: Option<Ipv4Addr>,
    done: Option<watch::Receiver<bool>>,
    clients: Option<Vec<DnsClient>>,
    err: Option<DnsError>,
}

/// DHCP-discovered upstream
pub struct DhcpClient {
    iface: String,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for DhcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpClient")
            .field("iface", &self.iface)
            .finish_non_exhaustive()
    }
}

impl DhcpClient {
    /// Create a client for `iface`; nothing is sent until the first query
    #[must_use]
    pub fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_owned(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Display address
    #[must_use]
    pub fn address(&self) -> String {
        format!("dhcp://{}", self.iface)
    }

    /// Race `query` over the discovered servers
    ///
    /// # Errors
    ///
    /// Returns the discovery or interface error, a timeout while the first
    /// discovery is still running, or the batch error.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let clients = timeout(DEFAULT_DNS_TIMEOUT, self.resolve())
            .await
            .map_err(|_| DnsError::timeout(format!("dhcp discovery on {}", self.iface), DEFAULT_DNS_TIMEOUT))??;
        batch_exchange(&clients, query).await.map(|(msg, _)| msg)
    }

    async fn resolve(&self) -> DnsResult<Vec<DnsClient>> {
        {
            let mut state = self.state.lock();
            match self.invalidate(&mut state) {
                Err(e) => state.err = Some(e),
                Ok(true) => {
                    let (tx, rx) = watch::channel(false);
                    state.done = Some(rx);
                    self.spawn_discovery(tx);
                }
                Ok(false) => {}
            }
        }

        loop {
            let (clients, err, done) = {
                let state = self.state.lock();
                (state.clients.clone(), state.err.clone(), state.done.clone())
            };

            if let Some(err) = err {
                return Err(err);
            }
            if let Some(clients) = clients {
                return Ok(clients);
            }
            let Some(mut done) = done else {
                return Err(DnsError::no_upstream(format!("no dhcp result for {}", self.iface)));
            };
            if done.wait_for(|finished| *finished).await.is_err() {
                return Err(DnsError::internal(format!("dhcp discovery on {} aborted", self.iface)));
            }
        }
    }

    fn invalidate(&self, state: &mut State) -> DnsResult<bool> {
        let now = Instant::now();
        if state.iface_invalidate.is_some_and(|deadline| now < deadline) {
            return Ok(false);
        }
        state.iface_invalidate = Some(now + IFACE_TTL);

        let ip = interface_ipv4(&self.iface)?;
        if state.dns_invalidate.is_some_and(|deadline| now < deadline) && state.iface_ip == Some(ip) {
            return Ok(false);
        }
        state.dns_invalidate = Some(now + DHCP_TTL);
        state.iface_ip = Some(ip);

        Ok(state.done.is_none())
    }

    fn spawn_discovery(&self, tx: watch::Sender<bool>) {
        let iface = self.iface.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = match timeout(DHCP_TIMEOUT, resolve_dns_from_dhcp(&iface)).await {
                Ok(result) => result,
                Err(_) => Err(DnsError::timeout(format!("dhcp discovery on {iface}"), DHCP_TIMEOUT)),
            };

            let (clients, err) = match result {
                Ok(servers) => {
                    info!(iface = %iface, ?servers, "dns servers discovered by dhcp");
                    let nameservers: Vec<NameServer> = servers
                        .iter()
                        .map(|ip| {
                            let mut server = NameServer::udp(SocketAddr::new(IpAddr::V4(*ip), DEFAULT_DNS_PORT).to_string());
                            server.interface = Some(iface.clone());
                            server
                        })
                        .collect();
                    (Some(transform(&nameservers, &ClientContext::default())), None)
                }
                Err(e) => {
                    warn!(iface = %iface, error = %e, "dhcp dns discovery failed");
                    (None, Some(e))
                }
            };

            let mut state = state.lock();
            state.done = None;
            state.clients = clients;
            state.err = err;
            drop(state);
            let _ = tx.send(true);
        });
    }
}

/// First IPv4 address of `iface`
fn interface_ipv4(iface: &str) -> DnsResult<Ipv4Addr> {
    let addrs = local_ip_address::list_afinet_netifas()
        .map_err(|e| DnsError::network(format!("list interfaces: {e}")))?;
    addrs
        .into_iter()
        .find_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if name == iface => Some(v4),
            _ => None,
        })
        .ok_or_else(|| DnsError::network(format!("interface {iface} has no IPv4 address")))
}

/// Hardware address of `iface`, random if unknown
fn interface_mac(iface: &str) -> [u8; 6] {
    let path = format!("/sys/class/net/{iface}/address");
    let parsed = std::fs::read_to_string(path).ok().and_then(|text| {
        let bytes: Vec<u8> = text
            .trim()
            .split(':')
            .filter_map(|part| u8::from_str_radix(part, 16).ok())
            .collect();
        <[u8; 6]>::try_from(bytes.as_slice()).ok()
    });
    parsed.unwrap_or_else(|| {
        let mut mac: [u8; 6] = rand::random();
        // locally administered unicast
        mac[0] = (mac[0] | 0x02) & 0xfe;
        mac
    })
}

/// Encode a DHCPDISCOVER asking for the DNS server option
fn build_discover(xid: u32, mac: [u8; 6]) -> Vec<u8> {
    let mut packet = vec![0u8; BOOTP_HEADER_LEN];
    packet[0] = 1; // BOOTREQUEST
    packet[1] = 1; // ethernet
    packet[2] = 6;
    packet[4..8].copy_from_slice(&xid.to_be_bytes());
    packet[10] = 0x80; // broadcast reply
    packet[28..34].copy_from_slice(&mac);

    packet.extend_from_slice(&MAGIC_COOKIE);
    packet.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, DHCPDISCOVER]);
    packet.extend_from_slice(&[
        OPT_PARAMETER_LIST,
        4,
        OPT_SUBNET_MASK,
        OPT_ROUTER,
        OPT_DNS,
        OPT_DOMAIN_NAME,
    ]);
    packet.push(OPT_END);
    packet
}

/// DNS servers of an offer or ack answering `xid`
fn parse_dns_servers(packet: &[u8], xid: u32) -> Option<Vec<Ipv4Addr>> {
    if packet.len() < BOOTP_HEADER_LEN + MAGIC_COOKIE.len()
        || packet[0] != 2
        || packet[4..8] != xid.to_be_bytes()
        || packet[BOOTP_HEADER_LEN..BOOTP_HEADER_LEN + 4] != MAGIC_COOKIE
    {
        return None;
    }

    let mut message_type = None;
    let mut servers = Vec::new();
    let mut options = &packet[BOOTP_HEADER_LEN + 4..];
    while let Some((&code, rest)) = options.split_first() {
        match code {
            OPT_PAD => {
                options = rest;
                continue;
            }
            OPT_END => break,
            _ => {}
        }
        let (&len, rest) = rest.split_first()?;
        let len = usize::from(len);
        if rest.len() < len {
            return None;
        }
        let (value, rest) = rest.split_at(len);
        match code {
            OPT_MESSAGE_TYPE => message_type = value.first().copied(),
            OPT_DNS => servers.extend(
                value
                    .chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3])),
            ),
            _ => {}
        }
        options = rest;
    }

    match message_type {
        Some(DHCPOFFER | DHCPACK) if !servers.is_empty() => Some(servers),
        _ => None,
    }
}

fn dhcp_socket(iface: &str) -> DnsResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DnsError::network_io("create dhcp socket", e))?;
    let setup = |r: io::Result<()>, what: &str| r.map_err(|e| DnsError::network_io(format!("dhcp socket {what}"), e));
    setup(socket.set_reuse_address(true), "SO_REUSEADDR")?;
    setup(socket.set_broadcast(true), "SO_BROADCAST")?;
    bind_device(&socket, iface)?;
    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT));
    setup(socket.bind(&local.into()), "bind")?;
    setup(socket.set_nonblocking(true), "non-blocking")?;
    UdpSocket::from_std(socket.into()).map_err(|e| DnsError::network_io("register dhcp socket", e))
}

/// Broadcast a DHCPDISCOVER on `iface` and collect the offered DNS servers
async fn resolve_dns_from_dhcp(iface: &str) -> DnsResult<Vec<Ipv4Addr>> {
    let socket = dhcp_socket(iface)?;
    let xid: u32 = rand::random();
    let discover = build_discover(xid, interface_mac(iface));

    let server = SocketAddr::from((Ipv4Addr::BROADCAST, DHCP_SERVER_PORT));
    socket
        .send_to(&discover, server)
        .await
        .map_err(|e| DnsError::network_io(format!("send DHCPDISCOVER on {iface}"), e))?;
    debug!(iface, xid, "DHCPDISCOVER sent");

    let mut buf = vec![0u8; 1500];
    loop {
        let (n, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| DnsError::network_io(format!("receive dhcp reply on {iface}"), e))?;
        match parse_dns_servers(&buf[..n], xid) {
            Some(servers) => return Ok(servers),
            None => debug!(iface, %from, "ignoring unrelated dhcp packet"),
        }
    }
}
