//! An in-memory reference [`Transport`] (§4.A): a process-wide named network
//! of queues shared by every [`InMemoryTransport`] built over the same
//! [`InMemoryNetwork`], honoring the same peek-lock contract a real broker
//! driver must.
//!
//! Receive semantics: a message is removed from its queue the instant
//! [`Transport::receive`] returns it (so no other consumer on the same
//! network can see it). If the owning transaction later commits, the removal
//! stands — that's the ack. If it aborts, the message is pushed back to the
//! front of its queue, immediately redeliverable — that's the abandon.
//!
//! Send semantics: [`Transport::send`] buffers via
//! [`rustbus_core::transport::enqueue_outgoing`] and registers exactly one
//! `on_committed` flush per transaction (guarded by [`TransactionContext::get_or_add`]
//! so a handler sending to three destinations still only registers one
//! flush), which drains the whole outbox into the network's queues.
//!
//! Delivery-count / dead-letter semantics (§4.B, seed scenario 6): every
//! queued message carries a delivery count. `receive` increments it before
//! returning the message; if the transaction later aborts and the count has
//! reached the transport's `max_deliveries`, the message is moved to the
//! network's dead-letter store for its source queue (with `rbs2-error-details`
//! populated from [`rustbus_core::transport::error_detail`]) instead of being
//! requeued.

use futures::future::BoxFuture;
use rustbus_core::headers::{TransportMessage, ERROR_DETAILS};
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::{
    enqueue_outgoing, error_detail_slot, Outbox, Transport, TransportError, OUTGOING_MESSAGES_KEY,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const FLUSH_REGISTERED_KEY: &str = "in-memory-transport-flush-registered";

/// Default delivery attempts before a message is dead-lettered, within the
/// spec's named 5-100 range (spec.md §4.B).
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: TransportMessage,
    delivery_count: u32,
}

/// A shared, process-wide set of named queues. Every [`InMemoryTransport`]
/// built over the same network can send to and receive from any address on
/// it, the way every node on a real broker can.
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    queues: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    dead_letters: Mutex<HashMap<String, Vec<TransportMessage>>>,
}

impl InMemoryNetwork {
    /// Create an empty, shared network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of messages currently queued at `address` (visible, not
    /// peek-locked out).
    #[must_use]
    pub fn queue_len(&self, address: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(address)
            .map_or(0, VecDeque::len)
    }

    /// Messages dead-lettered from `source_queue`, oldest first.
    #[must_use]
    pub fn dead_letters(&self, source_queue: &str) -> Vec<TransportMessage> {
        self.dead_letters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(source_queue)
            .cloned()
            .unwrap_or_default()
    }
}

/// A [`Transport`] over a shared [`InMemoryNetwork`], bound to one receive
/// address (or none, for a send-only endpoint).
#[derive(Clone)]
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    address: Option<String>,
    max_deliveries: u32,
}

impl InMemoryTransport {
    /// Build a transport that both sends and receives on `address`, with the
    /// default max-deliveries policy.
    #[must_use]
    pub fn new(network: Arc<InMemoryNetwork>, address: impl Into<String>) -> Self {
        Self {
            network,
            address: Some(address.into()),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Build a send-only transport with no receive address.
    #[must_use]
    pub fn send_only(network: Arc<InMemoryNetwork>) -> Self {
        Self { network, address: None, max_deliveries: DEFAULT_MAX_DELIVERIES }
    }

    /// Override the number of delivery attempts before a message is
    /// dead-lettered instead of redelivered.
    #[must_use]
    pub const fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    fn register_flush(&self, tx: &TransactionContext) {
        let outbox = tx.get_or_add(OUTGOING_MESSAGES_KEY, || Outbox::new(HashMap::new()));
        let network = Arc::clone(&self.network);
        tx.get_or_add(FLUSH_REGISTERED_KEY, move || {
            tx.on_committed(move || async move {
                let batches =
                    std::mem::take(&mut *outbox.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
                let mut queues = network.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                for (destination, messages) in batches {
                    queues.entry(destination).or_default().extend(
                        messages.into_iter().map(|message| QueuedMessage { message, delivery_count: 0 }),
                    );
                }
                Ok(())
            });
        });
    }
}

impl Transport for InMemoryTransport {
    fn create_queue(&self, address: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let network = Arc::clone(&self.network);
        let address = address.to_string();
        Box::pin(async move {
            network
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(address)
                .or_default();
            Ok(())
        })
    }

    fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        enqueue_outgoing(tx, destination, message);
        self.register_flush(tx);
        Box::pin(async { Ok(()) })
    }

    fn receive<'a>(
        &'a self,
        tx: &'a TransactionContext,
    ) -> BoxFuture<'a, Result<Option<TransportMessage>, TransportError>> {
        Box::pin(async move {
            let Some(address) = self.address.as_deref() else {
                return Err(TransportError::Other(
                    "transport has no receive address".to_string(),
                ));
            };

            let popped = {
                let mut queues = self.network.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                queues.entry(address.to_string()).or_default().pop_front()
            };
            let Some(mut popped) = popped else {
                return Ok(None);
            };
            popped.delivery_count += 1;

            let network = Arc::clone(&self.network);
            let address = address.to_string();
            let max_deliveries = self.max_deliveries;
            let error_slot = error_detail_slot(tx);
            let requeue = popped.clone();
            let message = popped.message.clone();
            tx.on_aborted(move || async move {
                if requeue.delivery_count >= max_deliveries {
                    let mut dead_message = requeue.message;
                    if let Some(detail) = error_slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
                    {
                        dead_message.headers.insert(ERROR_DETAILS.to_string(), detail);
                    }
                    network
                        .dead_letters
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .entry(address)
                        .or_default()
                        .push(dead_message);
                    // Recorded by metric name directly (not via
                    // `rustbus_runtime::metrics::TransportMetrics`) since this
                    // crate cannot take a regular dependency on the runtime
                    // crate it is a dev-dependency of.
                    metrics::counter!("transport_dead_letters_total").increment(1);
                } else {
                    network
                        .queues
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .entry(address)
                        .or_default()
                        .push_front(requeue);
                }
                Ok(())
            });

            Ok(Some(message))
        })
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn send_is_invisible_until_commit() {
        let network = InMemoryNetwork::new();
        let sender = InMemoryTransport::send_only(Arc::clone(&network));
        let tx = TransactionContext::new();

        sender
            .send("inbox", TransportMessage::new(b"hi".to_vec(), StdHashMap::new()), &tx)
            .await
            .unwrap();
        assert_eq!(network.queue_len("inbox"), 0);

        tx.commit().await;
        assert_eq!(network.queue_len("inbox"), 1);
    }

    #[tokio::test]
    async fn aborted_send_never_lands() {
        let network = InMemoryNetwork::new();
        let sender = InMemoryTransport::send_only(Arc::clone(&network));
        let tx = TransactionContext::new();

        sender
            .send("inbox", TransportMessage::new(b"hi".to_vec(), StdHashMap::new()), &tx)
            .await
            .unwrap();
        tx.abort().await;
        assert_eq!(network.queue_len("inbox"), 0);
    }

    #[tokio::test]
    async fn receive_is_peek_locked_and_redelivered_on_abort() {
        let network = InMemoryNetwork::new();
        network
            .queues
            .lock()
            .unwrap()
            .entry("inbox".to_string())
            .or_default()
            .push_back(QueuedMessage {
                message: TransportMessage::new(b"hi".to_vec(), StdHashMap::new()),
                delivery_count: 0,
            });

        let receiver = InMemoryTransport::new(Arc::clone(&network), "inbox");

        let tx1 = TransactionContext::new();
        let received = receiver.receive(&tx1).await.unwrap();
        assert!(received.is_some());
        assert_eq!(network.queue_len("inbox"), 0);

        tx1.abort().await;
        assert_eq!(network.queue_len("inbox"), 1);

        let tx2 = TransactionContext::new();
        let redelivered = receiver.receive(&tx2).await.unwrap();
        assert!(redelivered.is_some());
        tx2.commit().await;
        assert_eq!(network.queue_len("inbox"), 0);
    }

    #[tokio::test]
    async fn receive_on_empty_queue_returns_none() {
        let network = InMemoryNetwork::new();
        let receiver = InMemoryTransport::new(network, "inbox");
        let tx = TransactionContext::new();
        assert!(receiver.receive(&tx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_abort_dead_letters_after_max_deliveries_with_error_detail() {
        let network = InMemoryNetwork::new();
        let sender = InMemoryTransport::send_only(Arc::clone(&network));
        let send_tx = TransactionContext::new();
        sender
            .send("inbox", TransportMessage::new(b"poison".to_vec(), StdHashMap::new()), &send_tx)
            .await
            .unwrap();
        send_tx.commit().await;

        let receiver = InMemoryTransport::new(Arc::clone(&network), "inbox").with_max_deliveries(3);

        for attempt in 1..=3 {
            let tx = TransactionContext::new();
            let received = receiver.receive(&tx).await.unwrap();
            assert!(received.is_some(), "attempt {attempt} should still see the message");
            rustbus_core::transport::record_error_detail(&tx, "handler always throws");
            tx.abort().await;
        }

        assert_eq!(network.queue_len("inbox"), 0, "exhausted message is no longer redelivered");
        let dead = network.dead_letters("inbox");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].headers.get(ERROR_DETAILS).map(String::as_str), Some("handler always throws"));
        assert_eq!(dead[0].body, b"poison".to_vec());
    }
}
