//! Plain DNS over UDP, TCP and TLS
//!
//! - UDP: one datagram each way, with a 4096-byte receive buffer. A
//!   truncated answer is repeated over TCP.
//! - TCP and TLS: a fresh stream per query, with the 2-byte big-endian length
//!   prefix of RFC 1035 section 4.2.2 (RFC 7858 for TLS).
//!
//! Connections are opened through the server's [`Dialer`], so the server
//! hostname is resolved by the bootstrap resolver and the connection may
//! traverse a proxy adapter.

use std::sync::Arc;

use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::tls::{server_name, tls_config};
use super::{validate_response, ClientContext, MAX_TCP_MESSAGE_SIZE, UDP_BUFFER_SIZE};
use crate::dns::config::{split_host_port, NameServer, NameServerNet};
use crate::dns::dialer::Dialer;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::message::{from_wire, to_wire};
use crate::dns::DEFAULT_DNS_TIMEOUT;

/// Write one length-prefixed message
pub(crate) async fn write_framed<W>(writer: &mut W, bytes: &[u8], context: &str) -> DnsResult<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_TCP_MESSAGE_SIZE {
        return Err(DnsError::serialize(format!(
            "query too large: {} bytes (max {MAX_TCP_MESSAGE_SIZE})",
            bytes.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let len_prefix = (bytes.len() as u16).to_be_bytes();
    let mut send_buf = Vec::with_capacity(2 + bytes.len());
    send_buf.extend_from_slice(&len_prefix);
    send_buf.extend_from_slice(bytes);

    writer
        .write_all(&send_buf)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to send query to {context}"), e))?;
    writer
        .flush()
        .await
        .map_err(|e| DnsError::network_io(format!("failed to flush connection to {context}"), e))
}

/// Read one length-prefixed message
pub(crate) async fn read_framed<R>(reader: &mut R, context: &str) -> DnsResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        DnsError::network_io(format!("failed to read response length from {context}"), e)
    })?;

    let response_len = usize::from(u16::from_be_bytes(len_buf));
    if response_len == 0 {
        return Err(DnsError::parse(format!("received empty response from {context}")));
    }

    let mut response_buf = vec![0u8; response_len];
    reader.read_exact(&mut response_buf).await.map_err(|e| {
        DnsError::network_io(format!("failed to read response body from {context}"), e)
    })?;
    Ok(response_buf)
}

/// Transport of a [`BaseClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Net {
    Udp,
    Tcp,
    Tls,
}

/// UDP, TCP or TLS upstream
pub struct BaseClient {
    net: Net,
    host: String,
    port: u16,
    dialer: Dialer,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseClient")
            .field("address", &self.address())
            .field("dialer", &self.dialer)
            .finish_non_exhaustive()
    }
}

impl BaseClient {
    /// Build a client for a `udp`, `tcp` or `tls` server
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for other transports, a malformed
    /// address or an invalid TLS server name.
    pub fn new(server: &NameServer, ctx: &ClientContext) -> DnsResult<Self> {
        let net = match server.net {
            NameServerNet::Udp => Net::Udp,
            NameServerNet::Tcp => Net::Tcp,
            NameServerNet::Tls => Net::Tls,
            other => {
                return Err(DnsError::config(format!(
                    "{other} is not a plain DNS transport"
                )))
            }
        };

        let (host, port) = split_host_port(&server.addr)
            .ok_or_else(|| DnsError::config_field(format!("invalid address: {}", server.addr), "nameserver"))?;

        let tls = if net == Net::Tls {
            let config: Arc<ClientConfig> = tls_config(&[])?;
            Some((TlsConnector::from(config), server_name(host)?))
        } else {
            None
        };

        Ok(Self {
            net,
            host: host.to_owned(),
            port,
            dialer: Dialer::for_server(server, ctx.resolver.clone(), ctx.dispatcher.clone()),
            tls,
        })
    }

    /// Display address
    #[must_use]
    pub fn address(&self) -> String {
        let scheme = match self.net {
            Net::Udp => "udp",
            Net::Tcp => "tcp",
            Net::Tls => "tls",
        };
        if self.host.contains(':') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }

    /// Send `query` and wait for the validated answer
    ///
    /// # Errors
    ///
    /// Returns a network, timeout or parse error, or an upstream error when
    /// the answer does not match the query.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let bytes = to_wire(query)?;
        let response = match self.net {
            Net::Udp => {
                let response = self.exchange_udp(query, &bytes).await?;
                if response.truncated() {
                    debug!(upstream = %self.address(), "truncated udp answer, retrying over tcp");
                    self.exchange_stream(query, &bytes, false).await?
                } else {
                    response
                }
            }
            Net::Tcp => self.exchange_stream(query, &bytes, false).await?,
            Net::Tls => self.exchange_stream(query, &bytes, true).await?,
        };
        Ok(response)
    }

    async fn exchange_udp(&self, query: &Message, bytes: &[u8]) -> DnsResult<Message> {
        let deadline = Instant::now() + DEFAULT_DNS_TIMEOUT;
        let context = self.address();

        let conn = tokio::time::timeout_at(deadline, self.dialer.dial_udp(&self.host, self.port))
            .await
            .map_err(|_| DnsError::timeout(format!("dial {context}"), DEFAULT_DNS_TIMEOUT))??;

        conn.send(bytes)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send query to {context}"), e))?;

        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let n = tokio::time::timeout_at(deadline, conn.recv(&mut buf))
                .await
                .map_err(|_| DnsError::timeout(format!("udp read from {context}"), DEFAULT_DNS_TIMEOUT))?
                .map_err(|e| DnsError::network_io(format!("failed to read from {context}"), e))?;

            let response = match from_wire(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    trace!(upstream = %context, error = %e, "discarding malformed datagram");
                    continue;
                }
            };
            // stray datagrams are ignored until the deadline
            if validate_response(query, &response) {
                return Ok(response);
            }
            trace!(upstream = %context, id = response.id(), "discarding mismatched datagram");
        }
    }

    async fn exchange_stream(&self, query: &Message, bytes: &[u8], tls: bool) -> DnsResult<Message> {
        let context = self.address();
        let fut = async {
            let stream = self.dialer.dial_tcp(&self.host, self.port).await?;
            let response = match (&self.tls, tls) {
                (Some((connector, name)), true) => {
                    let mut stream = connector
                        .connect(name.clone(), stream)
                        .await
                        .map_err(|e| DnsError::network_io(format!("TLS handshake with {context}"), e))?;
                    write_framed(&mut stream, bytes, &context).await?;
                    read_framed(&mut stream, &context).await?
                }
                _ => {
                    let mut stream = stream;
                    write_framed(&mut stream, bytes, &context).await?;
                    read_framed(&mut stream, &context).await?
                }
            };
            from_wire(&response)
        };

        let response = timeout(DEFAULT_DNS_TIMEOUT, fut)
            .await
            .map_err(|_| DnsError::timeout(format!("exchange with {context}"), DEFAULT_DNS_TIMEOUT))??;

        if !validate_response(query, &response) {
            return Err(DnsError::upstream(
                &context,
                "response validation failed (ID or QNAME mismatch)",
            ));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use hickory_proto::op::MessageType;
    use hickory_proto::rr::RecordType;
    use tokio::net::{TcpListener, UdpSocket};

    use super::*;
    use crate::dns::message::{msg_to_ip, new_query, reply_with_ips};

    async fn tcp_server(ip: IpAddr) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let bytes = read_framed(&mut stream, "test").await.unwrap();
                    let query = Message::from_vec(&bytes).unwrap();
                    let reply = reply_with_ips(&query, &[ip], 60);
                    write_framed(&mut stream, &reply.to_vec().unwrap(), "test")
                        .await
                        .unwrap();
                });
            }
        });
        addr
    }

    fn client(net: NameServerNet, addr: SocketAddr) -> BaseClient {
        BaseClient::new(&NameServer::new(net, addr.to_string()), &ClientContext::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        let addr = tcp_server(ip).await;
        let query = new_query("example.com", RecordType::A).unwrap();

        let response = client(NameServerNet::Tcp, addr).exchange(&query).await.unwrap();
        assert_eq!(response.id(), query.id());
        assert_eq!(msg_to_ip(&response), vec![ip]);
    }

    #[tokio::test]
    async fn test_udp_ignores_mismatched_then_accepts() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4));

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();

            let mut stray = reply_with_ips(&query, &[IpAddr::V4(Ipv4Addr::LOCALHOST)], 60);
            stray.set_id(query.id().wrapping_add(1));
            server.send_to(&stray.to_vec().unwrap(), peer).await.unwrap();

            let reply = reply_with_ips(&query, &[ip], 60);
            server.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        let query = new_query("example.com", RecordType::A).unwrap();
        let response = client(NameServerNet::Udp, addr).exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&response), vec![ip]);
    }

    #[tokio::test]
    async fn test_truncated_udp_retries_over_tcp() {
        let tcp_ip = IpAddr::V4(Ipv4Addr::new(7, 7, 7, 7));
        let tcp_addr = tcp_server(tcp_ip).await;

        // udp on the same port as the tcp listener
        let udp = UdpSocket::bind(tcp_addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = udp.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut reply = reply_with_ips(&query, &[], 60);
            reply.set_message_type(MessageType::Response);
            reply.set_truncated(true);
            udp.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        let query = new_query("big.example", RecordType::A).unwrap();
        let response = client(NameServerNet::Udp, tcp_addr).exchange(&query).await.unwrap();
        assert!(!response.truncated());
        assert_eq!(msg_to_ip(&response), vec![tcp_ip]);
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let query = new_query("example.com", RecordType::A).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(6),
            client(NameServerNet::Tcp, addr).exchange(&query),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_address_formats() {
        let ctx = ClientContext::default();
        let v6 = BaseClient::new(&NameServer::new(NameServerNet::Tls, "[::1]:853"), &ctx).unwrap();
        assert_eq!(v6.address(), "tls://[::1]:853");

        let https = NameServer::new(NameServerNet::Https, "https://dns.google:443/dns-query");
        assert!(BaseClient::new(&https, &ctx).is_err());
    }
}
