//! QUIC plumbing shared by DoQ and DoH over HTTP/3

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, ConnectionError, Endpoint, EndpointConfig, TokioRuntime, TransportConfig, VarInt};
use rustls::ClientConfig;
use tokio::time::timeout;
use tracing::debug;

use crate::dns::dialer::Dialer;
use crate::dns::error::{DnsError, DnsResult};

/// Bound on connection establishment
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Retries after a retryable error on a reused connection
pub(crate) const MAX_RETRIES: usize = 2;

/// Bound on one query attempt; the first try and every retry fit inside
/// the batch exchange deadline
pub(crate) const ROUND_TRIP_TIMEOUT: Duration = Duration::from_millis(1500);

const IDLE_TIMEOUT_MS: u32 = 30_000;

/// Open a QUIC connection to `host:port`
///
/// The local socket honours the dialer's interface binding; proxies are not
/// traversed.
pub(crate) async fn connect(
    dialer: &Dialer,
    host: &str,
    port: u16,
    tls: Arc<ClientConfig>,
) -> DnsResult<(Endpoint, Connection)> {
    let ip = dialer.resolve_host(host).await?;
    let peer = SocketAddr::new(ip, port);

    let socket = dialer.bind_quic_socket(peer)?;
    let endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))
        .map_err(|e| DnsError::network_io(format!("create quic endpoint for {peer}"), e))?;

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| DnsError::config(format!("quic tls config: {e}")))?;
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(VarInt::from_u32(IDLE_TIMEOUT_MS).into()));
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport));

    let server_name = host.trim_start_matches('[').trim_end_matches(']');
    let connecting = endpoint
        .connect_with(config, peer, server_name)
        .map_err(|e| DnsError::network(format!("quic connect to {peer}: {e}")))?;

    let connection = timeout(HANDSHAKE_TIMEOUT, connecting)
        .await
        .map_err(|_| DnsError::timeout(format!("quic handshake with {peer}"), HANDSHAKE_TIMEOUT))?
        .map_err(|e| connection_error(&peer.to_string(), &e))?;

    debug!(%peer, "quic connection established");
    Ok((endpoint, connection))
}

/// Map a connection failure, marking the ones a fresh connection can fix
///
/// Idle timeouts, stateless resets, local closes and clean application
/// closes (code 0) are retryable.
pub(crate) fn connection_error(context: &str, err: &ConnectionError) -> DnsError {
    let retryable = match err {
        ConnectionError::TimedOut | ConnectionError::Reset | ConnectionError::LocallyClosed => true,
        ConnectionError::ApplicationClosed(close) => u64::from(close.error_code) == 0,
        _ => false,
    };
    let reason = format!("quic connection to {context}: {err}");
    if retryable {
        DnsError::network_retryable(reason)
    } else {
        DnsError::network(reason)
    }
}

/// Map a stream write failure
pub(crate) fn write_error(context: &str, err: &quinn::WriteError) -> DnsError {
    match err {
        quinn::WriteError::ConnectionLost(e) => connection_error(context, e),
        quinn::WriteError::ZeroRttRejected => {
            DnsError::network_retryable(format!("quic write to {context}: 0-RTT rejected"))
        }
        other => DnsError::network(format!("quic write to {context}: {other}")),
    }
}

/// Map a stream read failure
pub(crate) fn read_error(context: &str, err: &quinn::ReadExactError) -> DnsError {
    match err {
        quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(e)) => {
            connection_error(context, e)
        }
        quinn::ReadExactError::ReadError(quinn::ReadError::ZeroRttRejected) => {
            DnsError::network_retryable(format!("quic read from {context}: 0-RTT rejected"))
        }
        other => DnsError::network(format!("quic read from {context}: {other}")),
    }
}
