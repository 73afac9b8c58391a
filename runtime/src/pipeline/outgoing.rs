//! The canonical outgoing pipeline steps (§4.C): assign default headers,
//! auto-correlate, serialize, send.
//!
//! Runs synchronously inside `send`/`publish`/`reply` (see
//! [`crate::bus::Bus`]), before the owning transaction commits. The last
//! step only buffers the message onto the transaction's outbox
//! ([`rustbus_core::transport::enqueue_outgoing`]); the broker write itself
//! happens when the transaction commits.

use crate::metrics::TransportMetrics;
use chrono::SecondsFormat;
use futures::future::BoxFuture;
use rustbus_core::environment::{Clock, IdGenerator};
use rustbus_core::headers::{LogicalMessage, TransportMessage, CORRELATION_ID, MSG_ID, SENT_TIME};
use rustbus_core::pipeline::{NextFn, OutgoingStep, PipelineError, StepContext};
use rustbus_core::serializer::Serializer;
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::Transport;
use std::sync::Arc;
use std::time::Instant;

/// Item-bag key the destination this send targets is stored under.
pub const OUTBOUND_DESTINATION_KEY: &str = "outbound-destination";
/// Item-bag key the [`LogicalMessage`] being built for this send is stored
/// under. Mutated in place by [`AssignDefaultHeadersStep`] and
/// [`AutoCorrelateStep`].
pub const OUTBOUND_MESSAGE_KEY: &str = "outbound-logical-message";
/// Item-bag key the serialized [`TransportMessage`] is stored under once
/// [`SerializeStep`] has run.
pub const OUTBOUND_TRANSPORT_MESSAGE_KEY: &str = "outbound-transport-message";
/// Item-bag key the caller sets to the correlation id of the message being
/// handled, if this send is happening inside a handler body. Absent for a
/// send with no incoming message (e.g. a saga timeout or a client-initiated
/// send).
pub const INCOMING_CORRELATION_ID_KEY: &str = "incoming-correlation-id";

/// Assign `rbs2-msg-id` and `rbs2-senttime` if not already set (§4.C step
/// 1).
pub struct AssignDefaultHeadersStep {
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl AssignDefaultHeadersStep {
    /// Build the step over an id generator and clock.
    #[must_use]
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { ids, clock }
    }
}

impl OutgoingStep for AssignDefaultHeadersStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let message = ctx
                .get::<std::sync::Mutex<LogicalMessage>>(OUTBOUND_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no outbound message in context".to_string()))?;
            let mut message = message.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

            message
                .headers
                .entry(MSG_ID.to_string())
                .or_insert_with(|| self.ids.new_id());
            message
                .headers
                .entry(SENT_TIME.to_string())
                .or_insert_with(|| self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true));

            drop(message);
            next().await
        })
    }

    fn name(&self) -> &'static str {
        "AssignDefaultHeadersStep"
    }
}

/// Copy the incoming message's `rbs2-corr-id` onto the outbound message if
/// one isn't already set (§4.C step 2).
pub struct AutoCorrelateStep;

impl OutgoingStep for AutoCorrelateStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if let Some(incoming_corr_id) = ctx.get::<String>(INCOMING_CORRELATION_ID_KEY) {
                let message = ctx
                    .get::<std::sync::Mutex<LogicalMessage>>(OUTBOUND_MESSAGE_KEY)
                    .ok_or_else(|| PipelineError::Other("no outbound message in context".to_string()))?;
                message
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .headers
                    .entry(CORRELATION_ID.to_string())
                    .or_insert_with(|| (*incoming_corr_id).clone());
            }

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "AutoCorrelateStep"
    }
}

/// `LogicalMessage → TransportMessage` (§4.C step 3).
pub struct SerializeStep {
    serializer: Arc<dyn Serializer>,
}

impl SerializeStep {
    /// Build the step over a serializer.
    #[must_use]
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

impl OutgoingStep for SerializeStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let message = ctx
                .get::<std::sync::Mutex<LogicalMessage>>(OUTBOUND_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no outbound message in context".to_string()))?;
            let logical = message
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();

            let transport_message = self
                .serializer
                .serialize(logical)
                .await
                .map_err(|e| PipelineError::Other(e.to_string()))?;

            ctx.insert(OUTBOUND_TRANSPORT_MESSAGE_KEY, transport_message);
            next().await
        })
    }

    fn name(&self) -> &'static str {
        "SerializeStep"
    }
}

/// Buffer the serialized message onto the transaction's outbox for
/// `destination` (§4.C step 4). No broker I/O happens here; see
/// [`rustbus_core::transport::Transport::send`].
pub struct SendOutgoingMessageStep {
    transport: Arc<dyn Transport>,
}

impl SendOutgoingMessageStep {
    /// Build the step over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl OutgoingStep for SendOutgoingMessageStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let destination = ctx
                .get::<String>(OUTBOUND_DESTINATION_KEY)
                .ok_or_else(|| PipelineError::Other("no outbound destination in context".to_string()))?;
            let message = ctx
                .get::<TransportMessage>(OUTBOUND_TRANSPORT_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("outbound message not serialized".to_string()))?;

            let mut message = (*message).clone();
            message.sanitize_headers();

            let started = Instant::now();
            let sent = self.transport.send(&destination, message, tx).await;
            match sent {
                Ok(()) => TransportMetrics::record_send(1, started.elapsed()),
                Err(e) => {
                    TransportMetrics::record_send_error();
                    return Err(PipelineError::Other(e.to_string()));
                }
            }

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "SendOutgoingMessageStep"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FixedClock(DateTime<Utc>);
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct SequentialIds(std::sync::atomic::AtomicU64);
    impl IdGenerator for SequentialIds {
        fn new_id(&self) -> String {
            format!("id-{}", self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn assign_default_headers_fills_msg_id_and_senttime_once() {
        let ctx = StepContext::new();
        let tx = TransactionContext::new();
        ctx.insert(
            OUTBOUND_MESSAGE_KEY,
            StdMutex::new(LogicalMessage::new(Vec::new(), HashMap::new())),
        );

        let step = AssignDefaultHeadersStep::new(
            Arc::new(SequentialIds(std::sync::atomic::AtomicU64::new(0))),
            Arc::new(FixedClock(Utc::now())),
        );
        step.invoke(&ctx, &tx, Box::new(|| Box::pin(async { Ok(()) })))
            .await
            .unwrap();

        let message = ctx.get::<StdMutex<LogicalMessage>>(OUTBOUND_MESSAGE_KEY).unwrap();
        let message = message.lock().unwrap();
        assert_eq!(message.headers.get(MSG_ID).unwrap(), "id-0");
        assert!(message.headers.contains_key(SENT_TIME));
    }

    #[tokio::test]
    async fn auto_correlate_copies_incoming_correlation_id() {
        let ctx = StepContext::new();
        let tx = TransactionContext::new();
        ctx.insert(
            OUTBOUND_MESSAGE_KEY,
            StdMutex::new(LogicalMessage::new(Vec::new(), HashMap::new())),
        );
        ctx.insert(INCOMING_CORRELATION_ID_KEY, "corr-1".to_string());

        let step = AutoCorrelateStep;
        step.invoke(&ctx, &tx, Box::new(|| Box::pin(async { Ok(()) })))
            .await
            .unwrap();

        let message = ctx.get::<StdMutex<LogicalMessage>>(OUTBOUND_MESSAGE_KEY).unwrap();
        assert_eq!(message.lock().unwrap().headers.get(CORRELATION_ID).unwrap(), "corr-1");
    }

    struct RecordingTransport {
        sent: StdMutex<Vec<TransportMessage>>,
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
            _destination: &str,
            message: TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), rustbus_core::transport::TransportError>> {
            self.sent.lock().unwrap().push(message);
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
    async fn send_outgoing_message_step_truncates_oversized_headers_before_sending() {
        let ctx = StepContext::new();
        let tx = TransactionContext::new();
        ctx.insert(OUTBOUND_DESTINATION_KEY, "queue-a".to_string());

        let mut headers = HashMap::new();
        let oversized = "x".repeat(20_000);
        headers.insert("custom-header".to_string(), oversized.clone());
        ctx.insert(OUTBOUND_TRANSPORT_MESSAGE_KEY, TransportMessage::new(Vec::new(), headers));

        let transport = Arc::new(RecordingTransport {
            sent: StdMutex::new(Vec::new()),
        });
        let step = SendOutgoingMessageStep::new(Arc::clone(&transport) as Arc<dyn Transport>);
        step.invoke(&ctx, &tx, Box::new(|| Box::pin(async { Ok(()) })))
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let sent_value = sent[0].headers.get("custom-header").unwrap();
        assert!(sent_value.len() < oversized.len());
    }
}
