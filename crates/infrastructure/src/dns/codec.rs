//! DNS Message Codec
//!
//! The transport layer treats a DNS message as an opaque value with a 16-bit
//! ID and a TC flag. Everything else (records, EDNS(0), names) is left to
//! `hickory-proto`; this module only moves messages to and from wire bytes.

use ferrous_upstream_domain::DomainError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use std::str::FromStr;

/// Fixed DNS header size (RFC 1035 §4.1.1)
pub const DNS_HEADER_LEN: usize = 12;

/// Serialize a message to wire format.
pub fn encode(message: &Message) -> Result<Vec<u8>, DomainError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);

    message.emit(&mut encoder).map_err(|e| {
        DomainError::InvalidDnsMessage(format!("Failed to serialize DNS message: {}", e))
    })?;

    Ok(buf)
}

/// Serialize a message with `id` written into the header.
///
/// The caller's message is left untouched; only the wire copy carries the new ID.
pub fn encode_with_id(message: &Message, id: u16) -> Result<Vec<u8>, DomainError> {
    let mut buf = encode(message)?;
    if buf.len() < DNS_HEADER_LEN {
        return Err(DomainError::InvalidDnsMessage(format!(
            "Serialized message too short: {} bytes",
            buf.len()
        )));
    }
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message, DomainError> {
    Message::from_vec(bytes).map_err(|e| {
        DomainError::InvalidDnsMessage(format!("Failed to parse DNS message: {}", e))
    })
}

/// Reads the message ID straight from the header.
pub fn peek_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Rewrites the ID of a decoded message.
pub fn set_id(message: &mut Message, id: u16) {
    let mut header = *message.header();
    header.set_id(id);
    message.set_header(header);
}

/// Build a standard recursive query (random ID, RD set, one question).
///
/// Names are always fully qualified, so the question compares equal to the
/// one decoded from the answer.
pub fn build_query(domain: &str, record_type: RecordType) -> Result<Message, DomainError> {
    let mut name = Name::from_str(domain).map_err(|e| {
        DomainError::InvalidDnsMessage(format!("Invalid domain '{}': {}", domain, e))
    })?;
    name.set_fqdn(true);

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_a_query() {
        let message = build_query("google.com", RecordType::A).unwrap();
        let bytes = encode(&message).unwrap();

        assert!(bytes.len() >= DNS_HEADER_LEN);
        // Byte 2: QR(1) + Opcode(4) + AA(1) + TC(1) + RD(1)
        assert_eq!(bytes[2] & 0x01, 0x01, "RD flag should be set");
        assert_eq!(peek_id(&bytes), Some(message.id()));
    }

    #[test]
    fn test_encode_with_id_leaves_message_untouched() {
        let message = build_query("example.com", RecordType::AAAA).unwrap();
        let original_id = message.id();
        let rewritten = original_id.wrapping_add(1);

        let bytes = encode_with_id(&message, rewritten).unwrap();

        assert_eq!(peek_id(&bytes), Some(rewritten));
        assert_eq!(message.id(), original_id);
        assert_eq!(decode(&bytes).unwrap().queries(), message.queries());
    }

    #[test]
    fn test_query_name_survives_wire_round_trip() {
        let message = build_query("example.com", RecordType::A).unwrap();
        assert!(message.queries()[0].name().is_fqdn());

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.queries(), message.queries());

        let dotted = build_query("example.com.", RecordType::A).unwrap();
        assert_eq!(dotted.queries(), message.queries());
    }

    #[test]
    fn test_set_id_keeps_flags() {
        let mut message = build_query("example.com", RecordType::A).unwrap();
        message.set_truncated(true);

        set_id(&mut message, 0xBEEF);

        assert_eq!(message.id(), 0xBEEF);
        assert!(message.truncated());
        let bytes = encode(&message).unwrap();
        assert_eq!(peek_id(&bytes), Some(0xBEEF));
        assert_eq!(bytes[2] & 0x01, 0x01, "RD flag should survive");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xAB]).is_err());
        assert_eq!(peek_id(&[0xAB]), None);
    }

    #[test]
    fn test_invalid_domain() {
        let too_long_label = format!("{}.com", "a".repeat(64));
        assert!(build_query(&too_long_label, RecordType::A).is_err());
    }
}
