//! The transport abstraction: transactional send/receive over a named queue.
//!
//! Send semantics (§4.A): messages are buffered on the [`TransactionContext`]
//! under the [`OUTGOING_MESSAGES_KEY`] item, keyed by destination; no I/O
//! occurs until the transaction's `on_committed` callbacks fire. A handler
//! that sends N messages and then fails must send zero.
//!
//! Receive semantics (peek-lock model): the returned message remains
//! invisible to other consumers until the transaction either commits (⇒
//! transport ack) or aborts (⇒ transport abandon, immediately
//! re-deliverable). Implementations register their ack/abandon via
//! `tx.on_committed`/`tx.on_aborted` *before* returning the message from
//! [`Transport::receive`].

use crate::transaction::TransactionContext;
use crate::headers::TransportMessage;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Key under which the per-transaction outbox is stored via
/// [`TransactionContext::get_or_add`]. Public so that pipeline steps and
/// transport implementations agree on the shape without a direct dependency
/// cycle.
pub const OUTGOING_MESSAGES_KEY: &str = "outgoing-messages";

/// The per-transaction outbox: destination queue name → pending messages.
/// Populated by [`enqueue_outgoing`], drained by the outgoing pipeline at
/// commit time.
pub type Outbox = Mutex<HashMap<String, Vec<TransportMessage>>>;

/// Key under which the most recent handler-failure detail is recorded via
/// [`TransactionContext::get_or_add`]. A transport's `on_aborted` callback is
/// registered at receive time, before any handler error exists; this slot
/// lets the worker record the failure reason just before calling `tx.abort()`
/// so that callback can still read it when populating `rbs2-error-details`
/// on a message it dead-letters (§4.B).
pub const ERROR_DETAIL_KEY: &str = "transport-error-detail";

/// Per-transaction slot written by [`record_error_detail`] and read by
/// [`error_detail`].
pub type ErrorDetailSlot = Mutex<Option<String>>;

/// The shared slot backing [`record_error_detail`]/[`error_detail`] for
/// `tx`. A transport's `receive` can stash this `Arc` into an `on_aborted`
/// closure at registration time, before any error exists, and still observe
/// whatever the worker records into it later — `get_or_add` always returns
/// the same instance for the same key on the same transaction.
#[must_use]
pub fn error_detail_slot(tx: &TransactionContext) -> std::sync::Arc<ErrorDetailSlot> {
    tx.get_or_add(ERROR_DETAIL_KEY, || ErrorDetailSlot::new(None))
}

/// Record `detail` as the reason the current transaction is about to abort.
/// Call before `tx.abort()`.
pub fn record_error_detail(tx: &TransactionContext, detail: impl Into<String>) {
    *error_detail_slot(tx).lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(detail.into());
}

/// Read back the detail most recently recorded by [`record_error_detail`],
/// if any was recorded on this transaction.
#[must_use]
pub fn error_detail(tx: &TransactionContext) -> Option<String> {
    error_detail_slot(tx).lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
}

/// Buffer `message` for `destination` on `tx`'s outbox. No I/O happens here;
/// the message is only flushed once `tx` commits.
pub fn enqueue_outgoing(tx: &TransactionContext, destination: &str, message: TransportMessage) {
    let outbox = tx.get_or_add(OUTGOING_MESSAGES_KEY, || Outbox::new(HashMap::new()));
    outbox
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .entry(destination.to_string())
        .or_default()
        .push(message);
}

/// Errors a [`Transport`] implementation can surface. Whether a given error
/// is retriable is a property the caller determines with a classifier
/// predicate (see `rustbus_runtime::retry`), not a fixed variant here — the
/// same broker error can be transient in one deployment and fatal in
/// another.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The destination/address does not exist and could not be created.
    #[error("failed to create queue {address:?}: {reason}")]
    QueueCreationFailed {
        /// The address that failed to be created.
        address: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Sending a message to the broker failed.
    #[error("send to {destination:?} failed: {reason}")]
    SendFailed {
        /// Destination queue or topic.
        destination: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Receiving from the broker failed.
    #[error("receive failed: {reason}")]
    ReceiveFailed {
        /// Broker-reported reason.
        reason: String,
    },

    /// A peek-locked message could not be acknowledged or abandoned.
    #[error("failed to settle delivery {delivery_tag:?}: {reason}")]
    SettlementFailed {
        /// Broker delivery identifier.
        delivery_tag: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Generic transport-level failure not covered by a more specific
    /// variant.
    #[error("transport error: {0}")]
    Other(String),
}

/// How a [`Transport`] manages the broker's peek-lock lease while a message
/// is being handled.
///
/// Prefetching and lock-renewal are mutually exclusive (§9 design note):
/// prefetching assumes short handler times and disables renewal, renewal
/// assumes handlers may run close to the lease boundary and disables
/// prefetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Plain receive: no prefetch, no lock renewal.
    Plain,
    /// Spawn a lock-renewal task per in-flight message, refreshing the lease
    /// at 80% of the observed lease interval until the transaction ends.
    RenewOnLease,
    /// Drain a local queue of up to `N` prefetched messages before issuing a
    /// new broker receive call.
    Prefetch(u32),
}

impl Default for ReceiveMode {
    fn default() -> Self {
        Self::Plain
    }
}

/// A hint about the broker's current peek-lock lease for a received message,
/// used by a lock-renewal task to decide when to next renew.
///
/// Spec open question (§9): the reference transport recomputes `0.8 *
/// remaining` once at receive time. A production broker driver built against
/// this trait can instead refresh the interval from the real post-renewal
/// expiry by calling [`Transport::lease_hint`] again after each successful
/// renewal; the contract permits but does not require that.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseHint {
    /// How long until the broker considers the lock expired.
    pub remaining: Duration,
}

impl LeaseHint {
    /// The recommended renewal delay: 80% of the remaining lease.
    #[must_use]
    pub fn renewal_delay(&self) -> Duration {
        self.remaining.mul_f64(0.8)
    }
}

/// The transport contract: create queues, send under a transaction, and
/// receive under a transaction with peek-lock semantics.
///
/// Dyn-compatible by construction (`Pin<Box<dyn Future>>` returns instead of
/// `async fn`) so it can be held as `Arc<dyn Transport>` by the worker
/// scheduler and pipeline steps.
pub trait Transport: Send + Sync {
    /// Ensure `address` exists as a destination this transport can send to
    /// or receive from.
    fn create_queue(
        &self,
        address: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Buffer `message` for delivery to `destination` on `tx`'s outbox; no
    /// I/O happens until `tx` commits. Implementations typically call
    /// [`enqueue_outgoing`] and additionally register an `on_committed`
    /// callback (once per transaction, not once per call) that flushes every
    /// destination's queued batch.
    fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Receive the next message under peek-lock, or `None` if the queue is
    /// currently empty. The implementation must register ack/abandon via
    /// `tx.on_committed`/`tx.on_aborted` before returning.
    fn receive<'a>(
        &'a self,
        tx: &'a TransactionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TransportMessage>, TransportError>> + Send + 'a>>;

    /// This transport's own receive address, or `None` for a send-only
    /// endpoint.
    fn address(&self) -> Option<&str>;

    /// The receive mode this transport was configured with.
    fn receive_mode(&self) -> ReceiveMode {
        ReceiveMode::Plain
    }

    /// The current lease hint for the message most recently returned by
    /// [`Transport::receive`] on this transport, if the underlying broker
    /// exposes lock expiry information. `None` for transports with no
    /// concept of a lease (e.g. a send-only endpoint, or a broker without
    /// peek-lock semantics).
    fn lease_hint(&self) -> Option<LeaseHint> {
        None
    }
}
