//! Static response-code upstream (`rcode://<name>`)
//!
//! Answers every query locally with a fixed response code. Useful as a
//! policy target to refuse or blackhole domains.

use hickory_proto::op::{Message, ResponseCode};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::message::reply_with_rcode;

/// Accepted `rcode://` names
pub const RCODE_NAMES: [&str; 6] = [
    "success",
    "format_error",
    "server_failure",
    "name_error",
    "not_implemented",
    "refused",
];

fn rcode_from_name(name: &str) -> Option<ResponseCode> {
    match name {
        "success" => Some(ResponseCode::NoError),
        "format_error" => Some(ResponseCode::FormErr),
        "server_failure" => Some(ResponseCode::ServFail),
        "name_error" => Some(ResponseCode::NXDomain),
        "not_implemented" => Some(ResponseCode::NotImp),
        "refused" => Some(ResponseCode::Refused),
        _ => None,
    }
}

/// Upstream that never leaves the process
#[derive(Debug, Clone)]
pub struct RcodeClient {
    name: String,
    rcode: ResponseCode,
}

impl RcodeClient {
    /// Build a client for one of [`RCODE_NAMES`]
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an unknown name.
    pub fn new(name: &str) -> DnsResult<Self> {
        let rcode = rcode_from_name(name)
            .ok_or_else(|| DnsError::config_field(format!("unsupported rcode: {name}"), "nameserver"))?;
        Ok(Self {
            name: name.to_owned(),
            rcode,
        })
    }

    /// Display address
    #[must_use]
    pub fn address(&self) -> String {
        format!("rcode://{}", self.name)
    }

    /// The configured response code
    #[must_use]
    pub fn rcode(&self) -> ResponseCode {
        self.rcode
    }

    /// Reply to `query` with the configured code and no records
    #[must_use]
    pub fn exchange(&self, query: &Message) -> Message {
        reply_with_rcode(query, self.rcode)
    }
}

#[cfg(test)]
mod tests {
    use hickory_proto::rr::RecordType;

    use super::*;
    use crate::dns::message::new_query;

    #[test]
    fn test_every_name_maps() {
        for name in RCODE_NAMES {
            assert!(RcodeClient::new(name).is_ok(), "{name}");
        }
        assert!(RcodeClient::new("blackhole").is_err());
    }

    #[test]
    fn test_exchange_echoes_question() {
        let client = RcodeClient::new("name_error").unwrap();
        assert_eq!(client.address(), "rcode://name_error");

        let query = new_query("ads.example", RecordType::AAAA).unwrap();
        let reply = client.exchange(&query);
        assert_eq!(reply.id(), query.id());
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
        assert_eq!(reply.queries(), query.queries());
        assert!(reply.answers().is_empty());
    }
}
