//! The timeout manager contract: defer a message until a future time, then
//! re-emit it (§4.J).
//!
//! `get_due_messages` returns a snapshot-with-lease: a row is hidden from
//! other callers until the returned [`DueMessageBatch`] is dropped; rows not
//! marked completed by then are returned to the pool and become visible
//! again. A dedicated background worker (`rustbus_runtime::timeout_poller`)
//! polls `get_due_messages` at a small interval, re-sends each due message to
//! its `rbs2-defer-recipient`, then marks it complete.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a [`TimeoutManager`] implementation.
#[derive(Error, Debug, Clone)]
pub enum TimeoutStoreError {
    /// The store could not be read or written.
    #[error("timeout store error: {0}")]
    StoreError(String),
}

/// A message deferred until `due_at`, in the timeout store.
///
/// Invariant: [`TimeoutManager::get_due_messages`] returns every record with
/// `due_at <= now` and not yet completed; a record is deleted only after
/// [`DueMessage::mark_completed`] is called before the owning
/// [`DueMessageBatch`] is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueMessage {
    /// Store-assigned identifier for this deferred row.
    pub id: String,
    /// When this message becomes due.
    pub due_at: DateTime<Utc>,
    /// Headers captured at defer time (includes `rbs2-defer-recipient`).
    pub headers: HashMap<String, String>,
    /// The original message body.
    pub body: Vec<u8>,
}

/// A leased batch of [`DueMessage`]s returned by
/// [`TimeoutManager::get_due_messages`].
///
/// Dropping the batch without marking an entry completed returns it to the
/// pool, making it visible to the next caller again — exactly the RAII
/// lease-release idiom used by `rustbus_runtime::bottleneck::BottleneckToken`.
pub trait DueMessageBatch: Send {
    /// The messages in this batch.
    fn messages(&self) -> &[DueMessage];

    /// Mark the message at `id` as completed. It will be deleted from the
    /// store (not returned to the pool) once the batch is dropped.
    fn mark_completed<'a>(
        &'a mut self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TimeoutStoreError>> + Send + 'a>>;
}

/// The timeout manager contract.
pub trait TimeoutManager: Send + Sync {
    /// Defer `body`/`headers` until `due_at`.
    fn defer<'a>(
        &'a self,
        due_at: DateTime<Utc>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TimeoutStoreError>> + Send + 'a>>;

    /// Lease every currently-due, not-yet-completed message.
    fn get_due_messages(
        &self,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Box<dyn DueMessageBatch>, TimeoutStoreError>>
                + Send
                + '_,
        >,
    >;
}
