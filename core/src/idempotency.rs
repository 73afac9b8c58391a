//! Idempotency data embedded in saga payloads for the idempotent saga layer
//! (§4.L, §3 `IdempotencyData`).
//!
//! This module holds only the data shape; the suppress-and-replay control
//! flow lives in `rustbus_runtime::idempotent_saga` since it needs the
//! pipeline's outbox, not just the saga store.
//!
//! Outgoing records are stored logical (destination + headers + body, before
//! serialization) rather than as wire-level [`crate::headers::TransportMessage`]s,
//! so saga persistence never embeds a specific wire format; replay re-enters
//! the outgoing pipeline at [`crate::pipeline`]'s serialize step instead of
//! resending an already-serialized blob.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One message a saga sent while handling some message, recorded before
/// serialization so replay re-enters the outgoing pipeline rather than
/// resending an already-wire-encoded blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalOutboxEntry {
    /// The destination this message was sent (or published) to.
    pub destination: String,
    /// Headers assigned before serialization.
    pub headers: HashMap<String, String>,
    /// The body as handed to the serializer.
    pub body: Vec<u8>,
}

impl LogicalOutboxEntry {
    /// Build an entry from its destination, headers, and body.
    #[must_use]
    pub const fn new(destination: String, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { destination, headers, body }
    }
}

/// Tracks which incoming messages a saga has already handled, and what it
/// produced each time, so a redelivery can replay side effects instead of
/// re-running the handler body.
///
/// Invariant: `processed_message_ids.contains(msg_id)` implies the handler
/// must not execute again for `msg_id` — its recorded outgoing messages are
/// replayed from `outgoing_by_message_id` instead.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdempotencyData {
    /// Ids of messages whose handling has already been committed.
    pub processed_message_ids: HashSet<String>,
    /// For each processed message id, every outgoing message produced while
    /// handling it the first time.
    pub outgoing_by_message_id: HashMap<String, Vec<LogicalOutboxEntry>>,
}

impl IdempotencyData {
    /// An empty tracker, for a saga's first revision.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `msg_id` has already been handled by this saga.
    #[must_use]
    pub fn has_processed(&self, msg_id: &str) -> bool {
        self.processed_message_ids.contains(msg_id)
    }

    /// Record that `msg_id` was just handled and produced `outgoing`.
    pub fn record(&mut self, msg_id: impl Into<String>, outgoing: Vec<LogicalOutboxEntry>) {
        let msg_id = msg_id.into();
        self.outgoing_by_message_id.insert(msg_id.clone(), outgoing);
        self.processed_message_ids.insert(msg_id);
    }

    /// The outgoing messages to replay for an already-processed `msg_id`.
    #[must_use]
    pub fn replay_for(&self, msg_id: &str) -> &[LogicalOutboxEntry] {
        self.outgoing_by_message_id
            .get(msg_id)
            .map_or(&[], Vec::as_slice)
    }
}
