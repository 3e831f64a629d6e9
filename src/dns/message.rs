//! DNS message helpers shared by the resolver and the clients

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use super::error::{DnsError, DnsResult};

/// Upper bound on cached TTLs in seconds
pub const MAX_CACHE_TTL: u32 = 120;

/// Canonical cache and single-flight key of the first question
///
/// Lowercased `"name class type"`, e.g. `"example.com. IN A"`.
#[must_use]
pub fn question_key(msg: &Message) -> Option<String> {
    msg.queries().first().map(|q| {
        format!("{} {} {}", q.name(), q.query_class(), q.query_type()).to_lowercase()
    })
}

/// Whether the first question asks for an address (IN and A, AAAA or CNAME)
#[must_use]
pub fn is_ip_request(msg: &Message) -> bool {
    msg.queries().first().is_some_and(|q| {
        q.query_class() == DNSClass::IN
            && matches!(
                q.query_type(),
                RecordType::A | RecordType::AAAA | RecordType::CNAME
            )
    })
}

/// Queried name without the trailing dot
#[must_use]
pub fn msg_to_domain(msg: &Message) -> Option<String> {
    msg.queries().first().map(|q| {
        let name = q.name().to_ascii();
        name.trim_end_matches('.').to_owned()
    })
}

/// Addresses carried by A and AAAA answers
#[must_use]
pub fn msg_to_ip(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Minimal TTL across answers, else authority records, else additionals
///
/// OPT pseudo-records are ignored. Returns 0 for an empty message.
#[must_use]
pub fn min_ttl(msg: &Message) -> u32 {
    let min = |records: &[Record]| {
        records
            .iter()
            .filter(|r| r.record_type() != RecordType::OPT)
            .map(Record::ttl)
            .min()
    };
    min(msg.answers())
        .or_else(|| min(msg.name_servers()))
        .or_else(|| min(msg.additionals()))
        .unwrap_or(0)
}

/// TTL to cache `msg` with, capped at [`MAX_CACHE_TTL`]
///
/// Only a `NOERROR` response with answer records is cacheable; negative
/// answers (NXDOMAIN, NODATA) yield 0 even when they carry an SOA.
#[must_use]
pub fn cache_ttl(msg: &Message) -> u32 {
    if msg.response_code() != ResponseCode::NoError {
        return 0;
    }
    msg.answers()
        .iter()
        .filter(|r| r.record_type() != RecordType::OPT)
        .map(Record::ttl)
        .min()
        .unwrap_or(0)
        .min(MAX_CACHE_TTL)
}

fn map_records(records: Vec<Record>, mut f: impl FnMut(u32) -> u32) -> Vec<Record> {
    records
        .into_iter()
        .map(|mut r| {
            if r.record_type() != RecordType::OPT {
                let ttl = f(r.ttl());
                r.set_ttl(ttl);
            }
            r
        })
        .collect()
}

/// Set every record's TTL to `ttl`
pub fn set_msg_ttl(msg: &mut Message, ttl: u32) {
    let answers = map_records(msg.take_answers(), |_| ttl);
    let authority = map_records(msg.take_name_servers(), |_| ttl);
    let additional = map_records(msg.take_additionals(), |_| ttl);
    msg.insert_answers(answers);
    msg.insert_name_servers(authority);
    msg.insert_additionals(additional);
}

/// Shift TTLs so the smallest one becomes `ttl`
///
/// Every record loses the same delta, clamped to `[1, original]`. Nothing
/// changes when `ttl` is not below the current minimum.
///
/// # Example
///
/// ```
/// use rust_resolver::dns::message::{min_ttl, update_msg_ttl};
/// # use hickory_proto::op::Message;
/// # use hickory_proto::rr::{Name, RData, Record};
/// # use hickory_proto::rr::rdata::A;
/// # use std::str::FromStr;
/// let mut msg = Message::new();
/// for ttl in [60, 300] {
///     let name = Name::from_str("example.com.").unwrap();
///     msg.add_answer(Record::from_rdata(name, ttl, RData::A(A::new(1, 2, 3, 4))));
/// }
///
/// update_msg_ttl(&mut msg, 20);
/// assert_eq!(min_ttl(&msg), 20);
/// assert_eq!(msg.answers()[1].ttl(), 260);
/// ```
pub fn update_msg_ttl(msg: &mut Message, ttl: u32) {
    let min = min_ttl(msg);
    if ttl >= min {
        return;
    }
    let delta = min - ttl;
    let shift = move |t: u32| t.saturating_sub(delta).clamp(1, t.max(1));
    let answers = map_records(msg.take_answers(), shift);
    let authority = map_records(msg.take_name_servers(), shift);
    let additional = map_records(msg.take_additionals(), shift);
    msg.insert_answers(answers);
    msg.insert_name_servers(authority);
    msg.insert_additionals(additional);
}

/// Drop EDNS and any OPT record so the message can be cached
pub fn strip_opt(msg: &mut Message) {
    *msg.extensions_mut() = None;
    let additionals: Vec<Record> = msg
        .take_additionals()
        .into_iter()
        .filter(|r| r.record_type() != RecordType::OPT)
        .collect();
    msg.insert_additionals(additionals);
}

/// Build a recursive query for `name` and `record_type`
///
/// # Errors
///
/// Returns `DnsError::InvalidDomain` if `name` is not a valid DNS name.
pub fn new_query(name: &str, record_type: RecordType) -> DnsResult<Message> {
    let fqdn = if name.ends_with('.') {
        name.to_owned()
    } else {
        format!("{name}.")
    };
    let name = Name::from_ascii(&fqdn).map_err(|_| DnsError::invalid_domain(name))?;

    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, record_type));
    Ok(msg)
}

/// A response echoing the query's header and question with `rcode`
#[must_use]
pub fn reply_with_rcode(query: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(query.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(query.op_code());
    msg.set_recursion_desired(query.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    for q in query.queries() {
        msg.add_query(q.clone());
    }
    msg
}

/// A successful response carrying `ips` for the first question
#[must_use]
pub fn reply_with_ips(query: &Message, ips: &[IpAddr], ttl: u32) -> Message {
    let mut msg = reply_with_rcode(query, ResponseCode::NoError);
    msg.set_authoritative(true);
    let Some(q) = query.queries().first() else {
        return msg;
    };
    for ip in ips {
        let rdata = match (ip, q.query_type()) {
            (IpAddr::V4(v4), RecordType::A) => RData::A((*v4).into()),
            (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA((*v6).into()),
            _ => continue,
        };
        msg.add_answer(Record::from_rdata(q.name().clone(), ttl, rdata));
    }
    msg
}

/// Serialize to wire format
///
/// # Errors
///
/// Returns `DnsError::SerializeError` on encoding failure.
pub fn to_wire(msg: &Message) -> DnsResult<Vec<u8>> {
    msg.to_vec().map_err(|e| DnsError::serialize(e.to_string()))
}

/// Parse from wire format
///
/// # Errors
///
/// Returns `DnsError::ParseError` on malformed input.
pub fn from_wire(bytes: &[u8]) -> DnsResult<Message> {
    Message::from_vec(bytes).map_err(|e| DnsError::parse(e.to_string()))
}
