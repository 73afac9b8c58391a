//! Background worker that polls a [`TimeoutManager`] for due messages and
//! re-sends each one to its `rbs2-defer-recipient` (§4.J).
//!
//! Split from [`crate::worker::WorkerPool`] because deferral has nothing to
//! do with the incoming pipeline: a due message is re-emitted onto the
//! transport outbox directly, bypassing deserialize/route/saga entirely —
//! the recipient's own worker pool will receive and process it as an
//! ordinary message.

use rustbus_core::headers::{TransportMessage, DEFER_RECIPIENT};
use rustbus_core::timeout::{DueMessageBatch, TimeoutManager, TimeoutStoreError};
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default interval between `get_due_messages` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polls `timeouts` every `poll_interval`, re-sending each due message to the
/// address in its `rbs2-defer-recipient` header and marking it completed.
///
/// A due message missing `rbs2-defer-recipient` is marked completed and
/// dropped with a warning; there is nowhere to re-send it.
pub struct TimeoutPoller {
    stopping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TimeoutPoller {
    /// Start polling `timeouts` at `poll_interval`, re-emitting due messages
    /// through `transport`.
    #[must_use]
    pub fn start(
        timeouts: Arc<dyn TimeoutManager>,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
    ) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let loop_stopping = Arc::clone(&stopping);

        let handle = tokio::spawn(async move {
            loop {
                if loop_stopping.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(err) = poll_once(timeouts.as_ref(), transport.as_ref()).await {
                    tracing::warn!(error = %err, "timeout poller iteration failed");
                }

                tokio::time::sleep(poll_interval).await;
            }
        });

        Self { stopping, handle }
    }

    /// Stop the poller and wait for its current iteration to finish.
    pub async fn shutdown(self) {
        self.stopping.store(true, Ordering::Relaxed);
        let _ = self.handle.await;
    }
}

async fn poll_once(
    timeouts: &dyn TimeoutManager,
    transport: &dyn Transport,
) -> Result<(), TimeoutStoreError> {
    let mut batch = timeouts.get_due_messages().await?;

    let due: Vec<_> = batch.messages().to_vec();
    for message in due {
        let Some(recipient) = message.headers.get(DEFER_RECIPIENT).cloned() else {
            tracing::warn!(id = %message.id, "due message has no defer recipient, dropping");
            batch.mark_completed(&message.id).await?;
            continue;
        };

        let tx = TransactionContext::new();
        let send_result = transport
            .send(
                &recipient,
                TransportMessage::new(message.body.clone(), message.headers.clone()),
                &tx,
            )
            .await;

        match send_result {
            Ok(()) => {
                tx.commit().await;
                tx.dispose().await;
                batch.mark_completed(&message.id).await?;
                tracing::debug!(id = %message.id, recipient = %recipient, "re-emitted deferred message");
            }
            Err(err) => {
                tx.abort().await;
                tx.dispose().await;
                tracing::warn!(id = %message.id, recipient = %recipient, error = %err, "failed to re-emit deferred message, leaving it due for the next poll");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use rustbus_core::timeout::DueMessage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeTransport;
    impl Transport for FakeTransport {
        fn create_queue(
            &self,
            _address: &str,
        ) -> BoxFuture<'_, Result<(), rustbus_core::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn send(
            &self,
            _destination: &str,
            _message: TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), rustbus_core::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn receive<'a>(
            &'a self,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<Option<TransportMessage>, rustbus_core::transport::TransportError>>
        {
            Box::pin(async { Ok(None) })
        }
        fn address(&self) -> Option<&str> {
            None
        }
    }

    struct OneShotBatch {
        messages: Vec<DueMessage>,
        completed: Mutex<Vec<String>>,
    }

    impl DueMessageBatch for OneShotBatch {
        fn messages(&self) -> &[DueMessage] {
            &self.messages
        }

        fn mark_completed<'a>(
            &'a mut self,
            id: &'a str,
        ) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
            Box::pin(async move {
                self.completed.lock().unwrap().push(id.to_string());
                Ok(())
            })
        }
    }

    struct OneShotTimeouts {
        due: Mutex<Option<Vec<DueMessage>>>,
    }

    impl TimeoutManager for OneShotTimeouts {
        fn defer<'a>(
            &'a self,
            _due_at: chrono::DateTime<chrono::Utc>,
            _headers: HashMap<String, String>,
            _body: Vec<u8>,
        ) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
            Box::pin(async { Ok(()) })
        }

        fn get_due_messages(
            &self,
        ) -> BoxFuture<'_, Result<Box<dyn DueMessageBatch>, TimeoutStoreError>> {
            Box::pin(async move {
                let due = self.due.lock().unwrap().take().unwrap_or_default();
                Ok(Box::new(OneShotBatch {
                    messages: due,
                    completed: Mutex::new(Vec::new()),
                }) as Box<dyn DueMessageBatch>)
            })
        }
    }

    struct RecordingTransport {
        sent: Mutex<Vec<(String, TransportMessage)>>,
    }

    impl Transport for RecordingTransport {
        fn create_queue(
            &self,
            _address: &str,
        ) -> BoxFuture<'_, Result<(), rustbus_core::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn send(
            &self,
            destination: &str,
            message: TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), rustbus_core::transport::TransportError>> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), message));
            Box::pin(async { Ok(()) })
        }
        fn receive<'a>(
            &'a self,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<Option<TransportMessage>, rustbus_core::transport::TransportError>>
        {
            Box::pin(async { Ok(None) })
        }
        fn address(&self) -> Option<&str> {
            None
        }
    }

    #[tokio::test]
    async fn due_message_with_recipient_is_sent_through_the_transport_and_completed() {
        let mut headers = HashMap::new();
        headers.insert(DEFER_RECIPIENT.to_string(), "errors".to_string());
        let due = DueMessage {
            id: "row-2".to_string(),
            due_at: chrono::Utc::now(),
            headers,
            body: b"x".to_vec(),
        };
        let timeouts = OneShotTimeouts {
            due: Mutex::new(Some(vec![due])),
        };
        let transport = RecordingTransport {
            sent: Mutex::new(Vec::new()),
        };

        poll_once(&timeouts, &transport).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "errors");
        assert_eq!(sent[0].1.body, b"x".to_vec());
    }

    #[tokio::test]
    async fn due_message_without_recipient_is_marked_completed_not_resent() {
        let mut headers = HashMap::new();
        headers.insert("other".to_string(), "value".to_string());
        let due = DueMessage {
            id: "row-1".to_string(),
            due_at: chrono::Utc::now(),
            headers,
            body: b"x".to_vec(),
        };
        let timeouts = OneShotTimeouts {
            due: Mutex::new(Some(vec![due])),
        };

        poll_once(&timeouts, &FakeTransport).await.unwrap();
    }
}
