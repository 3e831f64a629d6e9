//! TLS client configuration shared by DoT, DoH and DoQ

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

use crate::dns::error::{DnsError, DnsResult};

/// Client config trusting the webpki roots, advertising `alpn`
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if the crypto provider rejects the
/// protocol versions.
pub(crate) fn tls_config(alpn: &[&[u8]]) -> DnsResult<Arc<ClientConfig>> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| DnsError::config(format!("TLS protocol versions: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// SNI / verification name for `host` (a DNS name or an IP literal)
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if `host` is neither.
pub(crate) fn server_name(host: &str) -> DnsResult<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|e| DnsError::config_field(format!("invalid TLS server name {host}: {e}"), "nameserver"))
}
