//! A JSON-backed [`Serializer`] (§4.G) for tests and doc examples.
//!
//! No concrete serializer ships in `rustbus-core` (an explicit external
//! collaborator, per its own docs) — this is the one this crate's own tests
//! and `rustbus-runtime`'s doctest examples use. Bodies are expected to
//! already be JSON-encoded bytes (e.g. via `serde_json::to_vec`); this
//! serializer's job is assigning/validating `rbs2-content-type`, not
//! re-encoding an already-typed domain value.

use futures::future::BoxFuture;
use rustbus_core::headers::{LogicalMessage, TransportMessage, CONTENT_TYPE, MSG_TYPE};
use rustbus_core::serializer::{FormatError, Serializer};

const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// Passes the body through unchanged, assigning `rbs2-content-type` on
/// serialize and validating it on deserialize.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: LogicalMessage) -> BoxFuture<'_, Result<TransportMessage, FormatError>> {
        Box::pin(async move {
            let LogicalMessage { body, mut headers } = message;
            if !body.is_empty() {
                serde_json::from_slice::<serde_json::Value>(&body).map_err(|e| FormatError::Malformed {
                    message_type: headers.get(MSG_TYPE).cloned(),
                    reason: e.to_string(),
                })?;
            }
            headers.entry(CONTENT_TYPE.to_string()).or_insert_with(|| JSON_CONTENT_TYPE.to_string());
            Ok(TransportMessage::new(body, headers))
        })
    }

    fn deserialize(&self, message: TransportMessage) -> BoxFuture<'_, Result<LogicalMessage, FormatError>> {
        Box::pin(async move {
            if let Some(content_type) = message.headers.get(CONTENT_TYPE) {
                if !content_type.starts_with("application/json") {
                    return Err(FormatError::UnknownContentType(content_type.clone()));
                }
            }
            Ok(LogicalMessage::new(message.body, message.headers))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn serialize_assigns_content_type_and_round_trips() {
        let serializer = JsonSerializer;
        let body = serde_json::to_vec(&serde_json::json!({ "order_id": "o-1" })).unwrap();
        let logical = LogicalMessage::new(body.clone(), HashMap::new());

        let wire = serializer.serialize(logical).await.unwrap();
        assert_eq!(wire.headers.get(CONTENT_TYPE).unwrap(), JSON_CONTENT_TYPE);

        let back = serializer.deserialize(wire).await.unwrap();
        assert_eq!(back.body, body);
    }

    #[tokio::test]
    async fn serialize_rejects_non_json_body() {
        let serializer = JsonSerializer;
        let logical = LogicalMessage::new(b"not json".to_vec(), HashMap::new());
        let err = serializer.serialize(logical).await.unwrap_err();
        assert!(matches!(err, FormatError::Malformed { .. }));
    }

    #[tokio::test]
    async fn deserialize_rejects_unknown_content_type() {
        let serializer = JsonSerializer;
        let mut headers = HashMap::new();
        headers.insert(CONTENT_TYPE.to_string(), "application/xml".to_string());
        let wire = TransportMessage::new(Vec::new(), headers);
        let err = serializer.deserialize(wire).await.unwrap_err();
        assert!(matches!(err, FormatError::UnknownContentType(_)));
    }

    #[tokio::test]
    async fn deserialize_with_no_content_type_header_passes_through() {
        let serializer = JsonSerializer;
        let wire = TransportMessage::new(b"[]".to_vec(), HashMap::new());
        let logical = serializer.deserialize(wire).await.unwrap();
        assert_eq!(logical.body, b"[]");
    }
}
