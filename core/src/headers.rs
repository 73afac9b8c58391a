//! Reserved transport message headers and the wire message types.
//!
//! Headers are the only cross-component metadata channel in the runtime; the
//! message body is opaque to every component except the [`crate::serializer::Serializer`].
//! The reserved keys below are part of the wire protocol and must be preserved
//! byte-for-byte by every [`crate::transport::Transport`] implementation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a transport message (`rbs2-msg-id`).
pub const MSG_ID: &str = "rbs2-msg-id";

/// Logical type tag used by deserialization (`rbs2-msg-type`).
pub const MSG_TYPE: &str = "rbs2-msg-type";

/// Content type of the message body, e.g. `application/json;charset=utf-8`
/// (`rbs2-content-type`).
pub const CONTENT_TYPE: &str = "rbs2-content-type";

/// Correlation id carried end-to-end across a saga conversation (`rbs2-corr-id`).
pub const CORRELATION_ID: &str = "rbs2-corr-id";

/// Address to which replies should be sent (`rbs2-return-address`).
pub const RETURN_ADDRESS: &str = "rbs2-return-address";

/// ISO-8601 timestamp recording when the message was sent (`rbs2-senttime`).
pub const SENT_TIME: &str = "rbs2-senttime";

/// ISO-8601 timestamp until which delivery of the message is deferred
/// (`rbs2-deferred-until`).
pub const DEFERRED_UNTIL: &str = "rbs2-deferred-until";

/// The address the timeout manager should re-emit a deferred message to
/// (`rbs2-defer-recipient`).
pub const DEFER_RECIPIENT: &str = "rbs2-defer-recipient";

/// Duration (ISO-8601) after which an undelivered message may be discarded
/// by the transport (`rbs2-time-to-be-received`).
pub const TIME_TO_BE_RECEIVED: &str = "rbs2-time-to-be-received";

/// Delivery intent: `p2p` (point-to-point) or `pub` (publish) (`rbs2-intent`).
pub const INTENT: &str = "rbs2-intent";

/// Error details attached to a message moved to the dead-letter queue
/// (`rbs2-error-details`).
pub const ERROR_DETAILS: &str = "rbs2-error-details";

/// Value of [`INTENT`] for point-to-point sends.
pub const INTENT_P2P: &str = "p2p";

/// Value of [`INTENT`] for publish/subscribe sends.
pub const INTENT_PUB: &str = "pub";

/// Header values longer than this are truncated on the way out to respect
/// broker property-size limits (§4.A of the runtime spec).
const MAX_HEADER_VALUE_LEN: usize = 16_300;

/// Number of leading/trailing bytes kept by [`truncate_header_value`] when a
/// value exceeds [`MAX_HEADER_VALUE_LEN`].
const TRUNCATION_EDGE_LEN: usize = 8_000;

/// Marker inserted between the kept head and tail of a truncated header value.
const TRUNCATION_MARKER: &str = "...[truncated]...";

/// Truncate an outbound header value that exceeds the broker-safe length.
///
/// Values longer than 16,300 characters are replaced with the first 8000
/// characters, a marker, and the last 8000 characters. Short values are
/// returned unchanged (no allocation beyond the original).
#[must_use]
pub fn truncate_header_value(value: &str) -> String {
    if value.chars().count() <= MAX_HEADER_VALUE_LEN {
        return value.to_string();
    }

    let chars: Vec<char> = value.chars().collect();
    let head: String = chars[..TRUNCATION_EDGE_LEN].iter().collect();
    let tail: String = chars[chars.len() - TRUNCATION_EDGE_LEN..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Apply [`truncate_header_value`] to every header in the map, in place.
pub fn truncate_headers(headers: &mut HashMap<String, String>) {
    for value in headers.values_mut() {
        if value.chars().count() > MAX_HEADER_VALUE_LEN {
            *value = truncate_header_value(value);
        }
    }
}

/// A message as it crosses the transport boundary: an opaque byte body plus
/// a string-keyed header map.
///
/// The body is never interpreted by anything except the
/// [`crate::serializer::Serializer`]. Reserved header keys (this module's
/// constants) are wire-visible and must round-trip unchanged through any
/// transport implementation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Opaque serialized body.
    pub body: Vec<u8>,
    /// Header map; reserved keys use the constants in this module.
    pub headers: HashMap<String, String>,
}

impl TransportMessage {
    /// Build a transport message from a body and header map.
    #[must_use]
    pub const fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// The message id (`rbs2-msg-id`), if present.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MSG_ID).map(String::as_str)
    }

    /// The logical type tag (`rbs2-msg-type`), if present.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MSG_TYPE).map(String::as_str)
    }

    /// The correlation id (`rbs2-corr-id`), if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID).map(String::as_str)
    }

    /// Truncate any oversized header values in place (§4.A header hygiene).
    pub fn sanitize_headers(&mut self) {
        truncate_headers(&mut self.headers);
    }
}

/// A deserialized message body plus its header map.
///
/// Invariant: `rbs2-msg-type` identifies a handler-resolvable type; if
/// absent, the message is routed as dynamic (untyped) per §3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Deserialized body, still represented generically as bytes at this
    /// layer — concrete handler dispatch reinterprets it by `message_type`.
    pub body: Vec<u8>,
    /// Headers carried over unchanged from the [`TransportMessage`].
    pub headers: HashMap<String, String>,
}

impl LogicalMessage {
    /// Build a logical message from a body and header map.
    #[must_use]
    pub const fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// The logical type tag (`rbs2-msg-type`), if present. Absence means the
    /// message is dynamic/untyped (§3 invariant).
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MSG_TYPE).map(String::as_str)
    }

    /// The correlation id (`rbs2-corr-id`), if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_value_is_unchanged() {
        let value = "application/json;charset=utf-8";
        assert_eq!(truncate_header_value(value), value);
    }

    #[test]
    fn oversized_header_value_is_truncated_with_marker() {
        let value = "a".repeat(20_000);
        let truncated = truncate_header_value(&value);
        assert!(truncated.len() < value.len());
        assert!(truncated.contains(TRUNCATION_MARKER));
        assert!(truncated.starts_with(&"a".repeat(10)));
        assert!(truncated.ends_with(&"a".repeat(10)));
    }

    #[test]
    fn sanitize_headers_only_touches_oversized_values() {
        let mut headers = HashMap::new();
        headers.insert(MSG_TYPE.to_string(), "OrderPlaced".to_string());
        headers.insert("big".to_string(), "x".repeat(17_000));
        let mut msg = TransportMessage::new(Vec::new(), headers);

        msg.sanitize_headers();

        assert_eq!(msg.headers.get(MSG_TYPE).unwrap(), "OrderPlaced");
        assert!(msg.headers.get("big").unwrap().len() < 17_000);
    }

    #[test]
    fn message_id_and_type_accessors() {
        let mut headers = HashMap::new();
        headers.insert(MSG_ID.to_string(), "abc-123".to_string());
        headers.insert(MSG_TYPE.to_string(), "OrderPlaced".to_string());
        let msg = TransportMessage::new(Vec::new(), headers);

        assert_eq!(msg.message_id(), Some("abc-123"));
        assert_eq!(msg.message_type(), Some("OrderPlaced"));
        assert_eq!(msg.correlation_id(), None);
    }
}
