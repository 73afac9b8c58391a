//! The serializer contract: [`LogicalMessage`] ↔ [`TransportMessage`]
//! round-trip (§4.G).
//!
//! No concrete serializer ships with this crate — serialization format is an
//! explicit external collaborator (spec §1 non-goals). `rustbus-testing`
//! provides a JSON-backed implementation for use in tests and doc examples
//! only.

use crate::headers::{LogicalMessage, TransportMessage, CONTENT_TYPE, MSG_TYPE};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while serializing or deserializing a message.
#[derive(Error, Debug, Clone)]
pub enum FormatError {
    /// The transport message's `rbs2-content-type` header names a content
    /// type this serializer does not understand.
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    /// The body could not be decoded as the claimed content type.
    #[error("malformed body for type {message_type:?}: {reason}")]
    Malformed {
        /// The `rbs2-msg-type` this body claimed to be.
        message_type: Option<String>,
        /// Decoder-reported reason.
        reason: String,
    },

    /// The body could not be encoded.
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
}

/// Converts between the wire-level [`TransportMessage`] and the
/// deserialized [`LogicalMessage`].
///
/// Implementations must set/read [`MSG_TYPE`] and [`CONTENT_TYPE`] (§4.G).
/// On an unknown content type, fail with [`FormatError::UnknownContentType`].
/// On a missing type tag, implementations may choose to deliver a
/// dynamic/untyped body rather than failing — the spec requires both paths
/// to be exercised by the test suite, not that one of them be rejected.
pub trait Serializer: Send + Sync {
    /// Serialize a logical message to its wire form.
    fn serialize(
        &self,
        message: LogicalMessage,
    ) -> Pin<Box<dyn Future<Output = Result<TransportMessage, FormatError>> + Send + '_>>;

    /// Deserialize a wire message to its logical form.
    fn deserialize(
        &self,
        message: TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<LogicalMessage, FormatError>> + Send + '_>>;
}
