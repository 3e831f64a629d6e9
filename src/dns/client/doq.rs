//! DNS over QUIC (RFC 9250)
//!
//! One QUIC connection (ALPN `doq`) is opened lazily and shared. Each query
//! runs on a fresh bidirectional stream:
//!
//! ```text
//! client ── [len:2][query, id=0] ── FIN ──▶ server
//! client ◀── [len:2][response] ─────────── server
//! ```
//!
//! On any error the connection the query used is closed, unless another
//! query already replaced it. Retryable errors on a reused connection are
//! retried up to twice on a new one.

use std::sync::Arc;

use hickory_proto::op::Message;
use quinn::{Connection, Endpoint, VarInt};
use rustls::ClientConfig;
use tokio::time::timeout;
use tracing::debug;

use super::quic::{self, read_error, write_error, MAX_RETRIES, ROUND_TRIP_TIMEOUT};
use super::slot::ConnSlot;
use super::tls::tls_config;
use super::ClientContext;
use crate::dns::config::{split_host_port, NameServer};
use crate::dns::dialer::Dialer;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::message::{from_wire, to_wire};

/// ALPN token of DNS over QUIC
const DOQ_ALPN: &[u8] = b"doq";

/// QUIC error code for "no error"
const DOQ_NO_ERROR: u32 = 0;

/// DNS-over-QUIC upstream
pub struct DoqClient {
    host: String,
    port: u16,
    dialer: Dialer,
    tls: Arc<ClientConfig>,
    conn: ConnSlot<(Endpoint, Connection)>,
}

impl std::fmt::Debug for DoqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoqClient")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl DoqClient {
    /// Build a client for a `quic://` server
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for a malformed address.
    pub fn new(server: &NameServer, ctx: &ClientContext) -> DnsResult<Self> {
        let (host, port) = split_host_port(&server.addr)
            .ok_or_else(|| DnsError::config_field(format!("DoQ format error: {}", server.addr), "nameserver"))?;
        Ok(Self {
            host: host.to_owned(),
            port,
            dialer: Dialer::for_server(server, ctx.resolver.clone(), ctx.dispatcher.clone()),
            tls: tls_config(&[DOQ_ALPN])?,
            conn: ConnSlot::new(),
        })
    }

    /// Display address
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("quic://[{}]:{}", self.host, self.port)
        } else {
            format!("quic://{}:{}", self.host, self.port)
        }
    }

    /// Close and forget the shared connection
    pub async fn reset_connection(&self) {
        if let Some(conn) = self.conn.take().await {
            close(&conn);
        }
    }

    /// Send `query` on a new stream of the shared connection
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let mut attempt = 0;
        loop {
            let lease = self
                .conn
                .acquire(
                    |(_, conn)| conn.close_reason().is_none(),
                    || quic::connect(&self.dialer, &self.host, self.port, Arc::clone(&self.tls)),
                )
                .await?;
            match self.round_trip(&lease.conn.1, query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if let Some(conn) = self.conn.discard(lease.generation).await {
                        close(&conn);
                    }
                    if lease.reused && e.is_retryable() && attempt < MAX_RETRIES {
                        attempt += 1;
                        debug!(upstream = %self.address(), attempt, error = %e, "retrying DoQ query on a new connection");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn round_trip(&self, conn: &Connection, query: &Message) -> DnsResult<Message> {
        let context = self.address();

        // RFC 9250 section 4.2.1: the message ID must be 0
        let mut wire_query = query.clone();
        wire_query.set_id(0);
        let bytes = to_wire(&wire_query)?;

        let fut = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| quic::connection_error(&context, &e))?;

            #[allow(clippy::cast_possible_truncation)]
            let len_prefix = (bytes.len() as u16).to_be_bytes();
            let mut buf = Vec::with_capacity(2 + bytes.len());
            buf.extend_from_slice(&len_prefix);
            buf.extend_from_slice(&bytes);
            send.write_all(&buf).await.map_err(|e| write_error(&context, &e))?;
            send.finish()
                .map_err(|e| DnsError::network(format!("finish DoQ stream to {context}: {e}")))?;

            let mut len_buf = [0u8; 2];
            recv.read_exact(&mut len_buf).await.map_err(|e| read_error(&context, &e))?;
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut body = vec![0u8; len];
            recv.read_exact(&mut body).await.map_err(|e| read_error(&context, &e))?;
            Ok::<_, DnsError>(body)
        };

        let body = timeout(ROUND_TRIP_TIMEOUT, fut)
            .await
            .map_err(|_| DnsError::timeout(format!("DoQ exchange with {context}"), ROUND_TRIP_TIMEOUT))??;

        let mut response = from_wire(&body)?;
        response.set_id(query.id());
        Ok(response)
    }
}

fn close((endpoint, conn): &(Endpoint, Connection)) {
    conn.close(VarInt::from_u32(DOQ_NO_ERROR), b"");
    endpoint.close(VarInt::from_u32(DOQ_NO_ERROR), b"");
}
