//! DNS-over-HTTPS (`DoH`) Client
//!
//! This module provides a `DoH` client implementing RFC 8484.
//!
//! # Features
//!
//! - GET requests with `?dns=<base64url>` and `accept: application/dns-message`
//! - HTTP/1.1 and HTTP/2 over tokio-rustls (picked by ALPN)
//! - HTTP/3 over quinn: forced by the `h3=true` param, or raced against TLS
//!   when `prefer-h3` is set
//! - One lazily created transport per client, recreated after errors; a
//!   failing query only discards the transport it used
//! - The message ID is sent as 0 and restored on the answer
//!
//! # Example
//!
//! ```no_run
//! use rust_resolver::dns::client::{ClientContext, DohClient};
//! use rust_resolver::dns::message::new_query;
//! use rust_resolver::dns::parse_nameserver;
//! use hickory_proto::rr::RecordType;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = parse_nameserver("https://dns.google/dns-query", false, false)?;
//! let client = DohClient::new(&server, &ClientContext::default())?;
//!
//! let query = new_query("example.com", RecordType::A)?;
//! let response = client.exchange(&query).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use hickory_proto::op::Message;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use quinn::{Endpoint, VarInt};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use super::quic::{self, HANDSHAKE_TIMEOUT, MAX_RETRIES, ROUND_TRIP_TIMEOUT};
use super::slot::ConnSlot;
use super::tls::{server_name, tls_config};
use super::ClientContext;
use crate::dns::config::NameServer;
use crate::dns::dialer::{BoxedStream, Dialer};
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::message::{from_wire, to_wire};

/// `DoH` content type (RFC 8484)
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Maximum accepted response body
const MAX_RESPONSE_SIZE: usize = 65535;

/// Which HTTP versions to try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H3Mode {
    /// HTTP/2 or HTTP/1.1 over TLS
    Never,
    /// Race HTTP/3 against TLS
    Prefer,
    /// HTTP/3 only
    Force,
}

type H3Sender = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// An established transport; cheap to clone
#[derive(Clone)]
enum Transport {
    Http1(Arc<Mutex<http1::SendRequest<Empty<Bytes>>>>),
    Http2(http2::SendRequest<Empty<Bytes>>),
    Http3 {
        sender: H3Sender,
        endpoint: Endpoint,
        connection: quinn::Connection,
    },
}

impl Transport {
    fn close(&self) {
        if let Self::Http3 {
            endpoint,
            connection,
            ..
        } = self
        {
            connection.close(VarInt::from_u32(0), b"");
            endpoint.close(VarInt::from_u32(0), b"");
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Http1(_) => "http/1.1",
            Self::Http2(_) => "h2",
            Self::Http3 { .. } => "h3",
        }
    }
}

/// DNS-over-HTTPS upstream
pub struct DohClient {
    url: Url,
    address: String,
    host: String,
    port: u16,
    tls: bool,
    h3: H3Mode,
    dialer: Dialer,
    tls_tcp: Arc<ClientConfig>,
    tls_quic: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    transport: ConnSlot<Transport>,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("address", &self.address)
            .field("h3", &self.h3)
            .finish_non_exhaustive()
    }
}

fn hyper_error(context: &str, err: &hyper::Error) -> DnsError {
    let reason = format!("DoH request to {context}: {err}");
    if err.is_closed() || err.is_canceled() || err.is_incomplete_message() || err.is_timeout() {
        DnsError::network_retryable(reason)
    } else {
        DnsError::network(reason)
    }
}

fn h3_error(context: &str, err: &h3::Error) -> DnsError {
    // stream failures on an h3 connection mean the connection is unusable
    DnsError::network_retryable(format!("DoH/3 request to {context}: {err}"))
}

impl DohClient {
    /// Build a client for an `https://` (or `http://`) server
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an unparsable URL, a missing host
    /// or an invalid TLS server name.
    pub fn new(server: &NameServer, ctx: &ClientContext) -> DnsResult<Self> {
        let url = Url::parse(&server.addr)
            .map_err(|e| DnsError::config_field(format!("invalid DoH url {}: {e}", server.addr), "nameserver"))?;
        let host = url
            .host_str()
            .ok_or_else(|| DnsError::config_field(format!("DoH url without host: {url}"), "nameserver"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(443);
        let tls = url.scheme() == "https";

        let h3 = if server.params.get("h3").is_some_and(|v| v == "true") {
            H3Mode::Force
        } else if server.prefer_h3 {
            H3Mode::Prefer
        } else {
            H3Mode::Never
        };

        Ok(Self {
            address: server.addr.clone(),
            server_name: server_name(&host)?,
            host,
            port,
            tls,
            h3: if tls { h3 } else { H3Mode::Never },
            dialer: Dialer::for_server(server, ctx.resolver.clone(), ctx.dispatcher.clone()),
            tls_tcp: tls_config(&[b"h2", b"http/1.1"])?,
            tls_quic: tls_config(&[b"h3"])?,
            url,
            transport: ConnSlot::new(),
        })
    }

    /// The server URL
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close and forget the cached transport
    pub async fn reset_connection(&self) {
        if let Some(transport) = self.transport.take().await {
            transport.close();
        }
    }

    /// Send `query` as a GET request
    ///
    /// Retryable errors on a reused transport are retried up to twice on a
    /// fresh one.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let mut wire_query = query.clone();
        wire_query.set_id(0);
        let uri = self.request_uri(&to_wire(&wire_query)?)?;

        let mut attempt = 0;
        loop {
            let lease = self
                .transport
                .acquire(|_| true, || self.connect())
                .await?;
            match self.round_trip(&lease.conn, &uri).await {
                Ok(body) => {
                    let mut response = from_wire(&body)?;
                    response.set_id(query.id());
                    return Ok(response);
                }
                Err(e) => {
                    if let Some(transport) = self.transport.discard(lease.generation).await {
                        transport.close();
                    }
                    if lease.reused && e.is_retryable() && attempt < MAX_RETRIES {
                        attempt += 1;
                        debug!(upstream = %self.address, attempt, error = %e, "retrying DoH query on a new transport");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn request_uri(&self, wire: &[u8]) -> DnsResult<Uri> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("dns", &URL_SAFE_NO_PAD.encode(wire));
        url.as_str()
            .parse::<Uri>()
            .map_err(|e| DnsError::internal(format!("DoH request uri: {e}")))
    }

    async fn connect(&self) -> DnsResult<Transport> {
        let transport = match self.h3 {
            H3Mode::Never => self.connect_tcp().await?,
            H3Mode::Force => self.connect_h3().await?,
            H3Mode::Prefer => self.connect_racing().await?,
        };
        debug!(upstream = %self.address, transport = transport.name(), "DoH transport ready");
        Ok(transport)
    }

    async fn connect_racing(&self) -> DnsResult<Transport> {
        let h3 = self.connect_h3();
        let tcp = self.connect_tcp();
        tokio::pin!(h3, tcp);

        tokio::select! {
            result = &mut h3 => match result {
                Ok(transport) => Ok(transport),
                Err(e) => {
                    debug!(upstream = %self.address, error = %e, "h3 lost the race, waiting for tls");
                    tcp.await
                }
            },
            result = &mut tcp => match result {
                Ok(transport) => Ok(transport),
                Err(e) => {
                    debug!(upstream = %self.address, error = %e, "tls lost the race, waiting for h3");
                    h3.await
                }
            },
        }
    }

    async fn connect_tcp(&self) -> DnsResult<Transport> {
        let setup = async {
            let stream = self.dialer.dial_tcp(&self.host, self.port).await?;
            let (io, h2): (BoxedStream, bool) = if self.tls {
                let tls = TlsConnector::from(Arc::clone(&self.tls_tcp))
                    .connect(self.server_name.clone(), stream)
                    .await
                    .map_err(|e| DnsError::network_io(format!("TLS handshake with {}", self.address), e))?;
                let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                (Box::new(tls), h2)
            } else {
                (stream, false)
            };

            let io = TokioIo::new(io);
            if h2 {
                let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
                    .await
                    .map_err(|e| hyper_error(&self.address, &e))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "DoH h2 connection closed");
                    }
                });
                Ok(Transport::Http2(sender))
            } else {
                let (sender, conn) = http1::handshake(io)
                    .await
                    .map_err(|e| hyper_error(&self.address, &e))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "DoH http/1.1 connection closed");
                    }
                });
                Ok(Transport::Http1(Arc::new(Mutex::new(sender))))
            }
        };

        timeout(HANDSHAKE_TIMEOUT, setup)
            .await
            .map_err(|_| DnsError::timeout(format!("DoH connect to {}", self.address), HANDSHAKE_TIMEOUT))?
    }

    async fn connect_h3(&self) -> DnsResult<Transport> {
        let (endpoint, connection) =
            quic::connect(&self.dialer, &self.host, self.port, Arc::clone(&self.tls_quic)).await?;

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(connection.clone()))
            .await
            .map_err(|e| h3_error(&self.address, &e))?;
        tokio::spawn(async move {
            let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        Ok(Transport::Http3 {
            sender,
            endpoint,
            connection,
        })
    }

    async fn round_trip(&self, transport: &Transport, uri: &Uri) -> DnsResult<Vec<u8>> {
        timeout(ROUND_TRIP_TIMEOUT, self.send(transport, uri))
            .await
            .map_err(|_| DnsError::timeout(format!("DoH exchange with {}", self.address), ROUND_TRIP_TIMEOUT))?
    }

    async fn send(&self, transport: &Transport, uri: &Uri) -> DnsResult<Vec<u8>> {
        let context = self.address.as_str();
        let (status, content_type, body) = match transport {
            Transport::Http1(sender) => {
                let path = uri.path_and_query().map_or("/", |p| p.as_str());
                let request = Request::get(path)
                    .header(HOST, uri.authority().map_or("", |a| a.as_str()))
                    .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
                    .body(Empty::<Bytes>::new())
                    .map_err(|e| DnsError::internal(format!("build DoH request: {e}")))?;

                let mut sender = sender.lock().await;
                sender.ready().await.map_err(|e| hyper_error(context, &e))?;
                let response = sender
                    .send_request(request)
                    .await
                    .map_err(|e| hyper_error(context, &e))?;
                drop(sender);
                let (parts, body) = response.into_parts();
                let body = body.collect().await.map_err(|e| hyper_error(context, &e))?.to_bytes();
                (parts.status, parts.headers.get(CONTENT_TYPE).cloned(), body.to_vec())
            }
            Transport::Http2(sender) => {
                let request = Request::get(uri.clone())
                    .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
                    .body(Empty::<Bytes>::new())
                    .map_err(|e| DnsError::internal(format!("build DoH request: {e}")))?;

                let mut sender = sender.clone();
                sender.ready().await.map_err(|e| hyper_error(context, &e))?;
                let response = sender
                    .send_request(request)
                    .await
                    .map_err(|e| hyper_error(context, &e))?;
                let (parts, body) = response.into_parts();
                let body = body.collect().await.map_err(|e| hyper_error(context, &e))?.to_bytes();
                (parts.status, parts.headers.get(CONTENT_TYPE).cloned(), body.to_vec())
            }
            Transport::Http3 { sender, .. } => {
                let request = Request::get(uri.clone())
                    .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
                    .body(())
                    .map_err(|e| DnsError::internal(format!("build DoH request: {e}")))?;

                let mut sender = sender.clone();
                let mut stream = sender
                    .send_request(request)
                    .await
                    .map_err(|e| h3_error(context, &e))?;
                stream.finish().await.map_err(|e| h3_error(context, &e))?;
                let response = stream.recv_response().await.map_err(|e| h3_error(context, &e))?;

                let mut body = BytesMut::new();
                while let Some(mut chunk) = stream.recv_data().await.map_err(|e| h3_error(context, &e))? {
                    if body.len() + chunk.remaining() > MAX_RESPONSE_SIZE {
                        return Err(DnsError::parse(format!("DoH response from {context} too large")));
                    }
                    body.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
                }
                (
                    response.status(),
                    response.headers().get(CONTENT_TYPE).cloned(),
                    body.to_vec(),
                )
            }
        };

        if status != StatusCode::OK {
            return Err(DnsError::upstream_rcode(
                context,
                format!("HTTP status {status}"),
                status.as_u16(),
            ));
        }
        if let Some(content_type) = content_type {
            if content_type.as_bytes() != DNS_MESSAGE_CONTENT_TYPE.as_bytes() {
                debug!(upstream = %context, content_type = ?content_type, "unexpected DoH content type");
            }
        }
        if body.is_empty() || body.len() > MAX_RESPONSE_SIZE {
            return Err(DnsError::parse(format!(
                "DoH response from {context} has invalid size {}",
                body.len()
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use hickory_proto::rr::RecordType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::dns::config::{parse_nameserver, NameServerNet};
    use crate::dns::message::{msg_to_ip, new_query, reply_with_ips};

    fn client(raw: &str) -> DohClient {
        let server = parse_nameserver(raw, false, false).unwrap();
        DohClient::new(&server, &ClientContext::default()).unwrap()
    }

    /// Minimal HTTP/1.1 DoH responder
    async fn http_server(ip: IpAddr) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap();
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    let target = head.split_whitespace().nth(1).unwrap().to_string();
                    let encoded = target.split("dns=").nth(1).unwrap();
                    let wire = URL_SAFE_NO_PAD.decode(encoded).unwrap();
                    let query = Message::from_vec(&wire).unwrap();
                    assert_eq!(query.id(), 0);

                    let body = reply_with_ips(&query, &[ip], 60).to_vec().unwrap();
                    let header = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\n\r\n",
                        body.len()
                    );
                    stream.write_all(header.as_bytes()).await.unwrap();
                    stream.write_all(&body).await.unwrap();
                });
            }
        });
        addr
    }

    #[test]
    fn test_h3_mode_selection() {
        assert_eq!(client("https://dns.google/dns-query").h3, H3Mode::Never);
        assert_eq!(client("https://dns.google/dns-query#h3=true").h3, H3Mode::Force);

        let server = parse_nameserver("https://dns.google/dns-query", false, true).unwrap();
        let doh = DohClient::new(&server, &ClientContext::default()).unwrap();
        assert_eq!(doh.h3, H3Mode::Prefer);

        // no h3 without tls
        let mut plain = NameServer::new(NameServerNet::Https, "http://127.0.0.1:80/dns-query");
        plain.prefer_h3 = true;
        let doh = DohClient::new(&plain, &ClientContext::default()).unwrap();
        assert_eq!(doh.h3, H3Mode::Never);
    }

    #[test]
    fn test_request_uri_appends_dns_param() {
        let doh = client("https://dns.example/resolve?ct=1");
        let uri = doh.request_uri(&[0, 0, 1, 0]).unwrap();
        let s = uri.to_string();
        assert!(s.starts_with("https://dns.example/resolve?ct=1&dns="));
        assert!(s.ends_with("AAABAA"));
    }

    #[tokio::test]
    async fn test_plain_http1_exchange_restores_id() {
        let ip = IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8));
        let addr = http_server(ip).await;
        let doh = client(&format!("http://{addr}/dns-query"));

        let query = new_query("example.com", RecordType::A).unwrap();
        let response = doh.exchange(&query).await.unwrap();
        assert_eq!(response.id(), query.id());
        assert_eq!(msg_to_ip(&response), vec![ip]);
    }

    #[tokio::test]
    async fn test_reset_connection_clears_transport() {
        let addr = http_server(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        let doh = client(&format!("http://{addr}/dns-query"));
        let query = new_query("example.com", RecordType::A).unwrap();
        doh.exchange(&query).await.unwrap();
        assert!(doh.transport.current_generation().await.is_some());

        doh.reset_connection().await;
        assert!(doh.transport.current_generation().await.is_none());
    }

    #[tokio::test]
    async fn test_late_failure_keeps_fresh_transport() {
        let addr = http_server(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        let doh = client(&format!("http://{addr}/dns-query"));
        let query = new_query("example.com", RecordType::A).unwrap();

        doh.exchange(&query).await.unwrap();
        let stale = doh.transport.current_generation().await.unwrap();

        // another query replaced the transport in the meantime
        doh.reset_connection().await;
        doh.exchange(&query).await.unwrap();
        let fresh = doh.transport.current_generation().await.unwrap();
        assert_ne!(stale, fresh);

        assert!(doh.transport.discard(stale).await.is_none());
        assert_eq!(doh.transport.current_generation().await, Some(fresh));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_real_doh_query() {
        let doh = client("https://1.1.1.1/dns-query");
        let query = new_query("example.com", RecordType::A).unwrap();
        let response = doh.exchange(&query).await.unwrap();
        assert!(!response.answers().is_empty());
    }
}
