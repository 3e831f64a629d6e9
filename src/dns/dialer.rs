//! Connections to upstream DNS servers
//!
//! Upstream clients never open sockets themselves; they ask a [`Dialer`]
//! built from their [`NameServer`](super::NameServer). The dialer picks one of
//! three routes:
//!
//! ```text
//! proxy adapter set ─────────────────────────▶ adapter.dial_tcp / listen_udp
//! proxy name == "RULES" ──▶ dispatcher.resolve_metadata ──▶ adapter
//! proxy name found in dispatcher.proxies() ──▶ adapter
//! otherwise ──▶ direct socket (bound to the named interface, if any)
//! ```
//!
//! Server hostnames are resolved through the bootstrap resolver when one is
//! attached, else through the system resolver. TCP through a proxy keeps the
//! hostname so the proxy can resolve it remotely; UDP always resolves first.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::config::NameServer;
use super::error::{DnsError, DnsResult};
use super::resolver::Resolver;
use super::DEFAULT_DNS_TIMEOUT;

/// Proxy name that routes the DNS connection by the dispatcher's rules
pub const RESPECT_RULES: &str = "RULES";

/// A byte stream to an upstream server
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Boxed upstream stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// A datagram socket bound to one remote peer
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send one datagram to the peer
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the peer
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

/// Transport of a dial request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Stream
    Tcp,
    /// Datagram
    Udp,
}

/// Destination of a dial request as seen by proxies and the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Transport
    pub network: Network,
    /// Destination hostname; empty when only `dst_ip` is known
    pub host: String,
    /// Resolved destination address
    pub dst_ip: Option<IpAddr>,
    /// Destination port
    pub dst_port: u16,
}

impl Metadata {
    /// Destination as a socket address, when resolved
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }
}

/// An outbound proxy the DNS connection itself can traverse
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Adapter name, also its identity
    fn name(&self) -> &str;

    /// Whether `listen_udp` is available
    fn supports_udp(&self) -> bool;

    /// Open a stream to the destination
    async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<BoxedStream>;

    /// Open a datagram association to the resolved destination
    async fn listen_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>>;
}

impl fmt::Debug for dyn ProxyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAdapter")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for dyn PacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConn").finish_non_exhaustive()
    }
}

/// The rule engine consuming resolved metadata
pub trait Dispatcher: Send + Sync {
    /// Pick the adapter (and the matched rule) for a connection
    ///
    /// # Errors
    ///
    /// Returns an error when no rule or adapter applies.
    fn resolve_metadata(&self, metadata: &Metadata) -> DnsResult<(Arc<dyn ProxyAdapter>, String)>;

    /// Named proxy adapters
    fn proxies(&self) -> HashMap<String, Arc<dyn ProxyAdapter>>;
}

enum Route {
    Direct { interface: Option<String> },
    Proxy(Arc<dyn ProxyAdapter>),
}

/// Opens connections for one upstream server
#[derive(Clone, Default)]
pub struct Dialer {
    proxy_adapter: Option<Arc<dyn ProxyAdapter>>,
    proxy_name: Option<String>,
    interface: Option<String>,
    resolver: Option<Resolver>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("proxy_adapter", &self.proxy_adapter.as_ref().map(|a| a.name().to_owned()))
            .field("proxy_name", &self.proxy_name)
            .field("interface", &self.interface)
            .field("bootstrap", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Dialer that connects directly and resolves through the system
    #[must_use]
    pub fn direct() -> Self {
        Self::default()
    }

    /// Dialer for `server`, resolving its host through `resolver`
    #[must_use]
    pub fn for_server(
        server: &NameServer,
        resolver: Option<Resolver>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Self {
        Self {
            proxy_adapter: server.proxy_adapter.clone(),
            proxy_name: server.proxy_name.clone().filter(|n| !n.is_empty()),
            interface: server.interface.clone().filter(|i| !i.is_empty()),
            resolver,
            dispatcher,
        }
    }

    /// Bind direct sockets to `interface`
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Whether a proxy adapter or proxy name is configured
    #[must_use]
    pub fn is_proxied(&self) -> bool {
        self.proxy_adapter.is_some() || self.proxy_name.is_some()
    }

    fn route(&self, metadata: &Metadata) -> DnsResult<Route> {
        if let Some(adapter) = &self.proxy_adapter {
            return Ok(Route::Proxy(Arc::clone(adapter)));
        }

        let Some(name) = self.proxy_name.as_deref() else {
            return Ok(Route::Direct {
                interface: self.interface.clone(),
            });
        };

        let Some(dispatcher) = &self.dispatcher else {
            if name == RESPECT_RULES {
                return Ok(Route::Direct {
                    interface: self.interface.clone(),
                });
            }
            return Ok(Route::Direct {
                interface: Some(name.to_owned()),
            });
        };

        if name == RESPECT_RULES {
            let (adapter, rule) = dispatcher.resolve_metadata(metadata)?;
            debug!(host = %metadata.host, proxy = adapter.name(), rule = %rule, "dns connection follows rules");
            return Ok(Route::Proxy(adapter));
        }

        match dispatcher.proxies().get(name) {
            Some(adapter) => Ok(Route::Proxy(Arc::clone(adapter))),
            // an unknown proxy name is an interface name
            None => Ok(Route::Direct {
                interface: Some(name.to_owned()),
            }),
        }
    }

    /// Resolve an upstream server host to one address, IPv4 first
    ///
    /// # Errors
    ///
    /// Returns `DnsError::IpNotFound` if the host has no address.
    pub async fn resolve_host(&self, host: &str) -> DnsResult<IpAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(resolver) = &self.resolver {
            let ips = Box::pin(resolver.lookup_ip_primary_ipv4(host)).await?;
            return ips
                .first()
                .copied()
                .ok_or_else(|| DnsError::ip_not_found(host));
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| DnsError::network_io(format!("system lookup of {host} failed"), e))?;
        let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| DnsError::ip_not_found(host))
    }

    /// Open a stream to `host:port`
    ///
    /// # Errors
    ///
    /// Returns a network or timeout error if the connection cannot be made.
    pub async fn dial_tcp(&self, host: &str, port: u16) -> DnsResult<BoxedStream> {
        let mut metadata = Metadata {
            network: Network::Tcp,
            host: host.to_owned(),
            dst_ip: None,
            dst_port: port,
        };
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            metadata.host.clear();
            metadata.dst_ip = Some(ip);
        }

        match self.route(&metadata)? {
            Route::Proxy(adapter) => {
                let stream = adapter.dial_tcp(&metadata).await.map_err(|e| {
                    DnsError::network_io(format!("dial {host}:{port} via {}", adapter.name()), e)
                })?;
                Ok(stream)
            }
            Route::Direct { interface } => {
                let ip = match metadata.dst_ip {
                    Some(ip) => ip,
                    None => self.resolve_host(host).await?,
                };
                let stream = connect_tcp(SocketAddr::new(ip, port), interface.as_deref()).await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Open a datagram association to `host:port`
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved, the proxy lacks UDP
    /// support, or the socket cannot be set up.
    pub async fn dial_udp(&self, host: &str, port: u16) -> DnsResult<Box<dyn PacketConn>> {
        let ip = self.resolve_host(host).await?;
        let metadata = Metadata {
            network: Network::Udp,
            host: String::new(),
            dst_ip: Some(ip),
            dst_port: port,
        };

        match self.route(&metadata)? {
            Route::Proxy(adapter) => {
                if !adapter.supports_udp() {
                    return Err(DnsError::network(format!(
                        "proxy adapter [{}] UDP is not supported",
                        adapter.name()
                    )));
                }
                adapter.listen_udp(&metadata).await.map_err(|e| {
                    DnsError::network_io(format!("listen udp via {}", adapter.name()), e)
                })
            }
            Route::Direct { interface } => {
                let addr = SocketAddr::new(ip, port);
                let socket = bind_udp(addr, interface.as_deref())?;
                let socket = UdpSocket::from_std(socket)
                    .map_err(|e| DnsError::network_io("register udp socket", e))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| DnsError::network_io(format!("connect udp {addr}"), e))?;
                Ok(Box::new(socket))
            }
        }
    }

    /// Bind a local UDP socket for a QUIC endpoint talking to `peer`
    ///
    /// QUIC transports only go direct; the interface binding still applies.
    ///
    /// # Errors
    ///
    /// Returns a network error if the socket cannot be created.
    pub fn bind_quic_socket(&self, peer: SocketAddr) -> DnsResult<std::net::UdpSocket> {
        if self.is_proxied() && self.proxy_name.as_deref() != Some(RESPECT_RULES) {
            debug!(%peer, "quic transport ignores proxy, dialing direct");
        }
        let interface = self
            .interface
            .clone()
            .or_else(|| self.unresolved_interface_name());
        bind_udp(peer, interface.as_deref())
    }

    /// A proxy name that is not a known adapter is treated as an interface
    fn unresolved_interface_name(&self) -> Option<String> {
        let name = self.proxy_name.as_deref()?;
        if name == RESPECT_RULES || self.proxy_adapter.is_some() {
            return None;
        }
        match &self.dispatcher {
            Some(d) if d.proxies().contains_key(name) => None,
            _ => Some(name.to_owned()),
        }
    }
}

/// Apply `SO_BINDTODEVICE`
#[cfg(target_os = "linux")]
pub(crate) fn bind_device(socket: &Socket, interface: &str) -> DnsResult<()> {
    use std::os::fd::AsRawFd;

    // IFNAMSIZ including the terminator
    if interface.len() > 15 {
        return Err(DnsError::config_field(
            format!("interface name too long: {interface} (max 15 chars)"),
            "nameserver.interface",
        ));
    }

    let mut ifname = [0u8; 16];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    // SAFETY: fd is owned by `socket`; the buffer outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(DnsError::network_io(
            format!("bind to interface {interface}"),
            io::Error::last_os_error(),
        ));
    }

    debug!(interface, "bound dns socket to interface");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_device(_socket: &Socket, interface: &str) -> DnsResult<()> {
    tracing::warn!(interface, "interface binding is only supported on linux");
    Ok(())
}

fn bind_udp(peer: SocketAddr, interface: Option<&str>) -> DnsResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DnsError::network_io("create udp socket", e))?;
    if let Some(interface) = interface {
        bind_device(&socket, interface)?;
    }

    let local: SocketAddr = if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket
        .bind(&local.into())
        .map_err(|e| DnsError::network_io("bind udp socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DnsError::network_io("set udp socket non-blocking", e))?;
    Ok(socket.into())
}

async fn connect_tcp(addr: SocketAddr, interface: Option<&str>) -> DnsResult<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| DnsError::network_io("create tcp socket", e))?;
    if let Some(interface) = interface {
        bind_device(&socket, interface)?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| DnsError::network_io("set tcp socket non-blocking", e))?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(DnsError::network_io(format!("connect {addr}"), e)),
    }

    let stream = TcpStream::from_std(socket.into())
        .map_err(|e| DnsError::network_io("register tcp stream", e))?;

    let connect_timeout: Duration = DEFAULT_DNS_TIMEOUT;
    timeout(connect_timeout, async {
        stream
            .writable()
            .await
            .map_err(|e| DnsError::network_io(format!("connect {addr}"), e))?;
        match stream.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => Err(DnsError::network_io(format!("connect {addr}"), e)),
        }
    })
    .await
    .map_err(|_| DnsError::timeout(format!("tcp connect to {addr}"), connect_timeout))??;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set TCP_NODELAY failed");
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Default)]
    struct CountingAdapter {
        tcp_dials: AtomicUsize,
    }

    #[async_trait]
    impl ProxyAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "counting"
        }

        fn supports_udp(&self) -> bool {
            false
        }

        async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<BoxedStream> {
            self.tcp_dials.fetch_add(1, Ordering::SeqCst);
            let addr = metadata
                .socket_addr()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolved"))?;
            Ok(Box::new(TcpStream::connect(addr).await?))
        }

        async fn listen_udp(&self, _metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no udp"))
        }
    }

    struct StaticDispatcher {
        adapter: Arc<CountingAdapter>,
    }

    impl Dispatcher for StaticDispatcher {
        fn resolve_metadata(
            &self,
            _metadata: &Metadata,
        ) -> DnsResult<(Arc<dyn ProxyAdapter>, String)> {
            Ok((self.adapter.clone(), "MATCH".into()))
        }

        fn proxies(&self) -> HashMap<String, Arc<dyn ProxyAdapter>> {
            let mut map: HashMap<String, Arc<dyn ProxyAdapter>> = HashMap::new();
            map.insert("counting".into(), self.adapter.clone());
            map
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 16];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let _ = stream.write_all(&buf[..n]).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_direct_tcp() {
        let addr = echo_server().await;
        let mut stream = Dialer::direct()
            .dial_tcp(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_direct_udp_is_connected() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let conn = Dialer::direct().dial_udp("127.0.0.1", addr.port()).await.unwrap();
        conn.send(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        server.send_to(b"world", from).await.unwrap();

        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_named_proxy_and_rules_route_through_adapter() {
        let addr = echo_server().await;
        let adapter = Arc::new(CountingAdapter::default());
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(StaticDispatcher {
            adapter: adapter.clone(),
        });

        for name in ["counting", RESPECT_RULES] {
            let server = NameServer {
                proxy_name: Some(name.into()),
                ..NameServer::udp(addr.to_string())
            };
            let dialer = Dialer::for_server(&server, None, Some(dispatcher.clone()));
            assert!(dialer.is_proxied());
            dialer
                .dial_tcp(&addr.ip().to_string(), addr.port())
                .await
                .unwrap();
        }
        assert_eq!(adapter.tcp_dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_proxy_without_udp_is_rejected() {
        let adapter: Arc<dyn ProxyAdapter> = Arc::new(CountingAdapter::default());
        let server = NameServer {
            proxy_adapter: Some(adapter),
            ..NameServer::udp("127.0.0.1:53")
        };
        let err = Dialer::for_server(&server, None, None)
            .dial_udp("127.0.0.1", 53)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("UDP is not supported"));
    }

    #[tokio::test]
    async fn test_resolve_literal_hosts() {
        let dialer = Dialer::direct();
        assert_eq!(
            dialer.resolve_host("[::1]").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            dialer.resolve_host("10.0.0.1").await.unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_interface_name_too_long() {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        let err = bind_device(&socket, "this_is_a_very_long_interface_name").unwrap_err();
        assert!(err.to_string().contains("too long"));
    }
}
