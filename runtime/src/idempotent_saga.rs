//! The idempotent saga layer (§4.L): suppress re-running a saga handler for
//! a message it has already processed, replaying its recorded outgoing
//! messages instead.
//!
//! Opt-in per saga via a reserved `__idempotency` field inside the saga's
//! JSON payload rather than a dedicated trait — the payload is already
//! untyped `serde_json::Value` (§4.K), so a reserved field is the same kind
//! of convention the pipeline already uses for its header keys, without
//! forcing every saga data type to be a fixed concrete struct.
//!
//! Limitation: outgoing messages are attributed to a saga invocation by
//! diffing the transaction's outbox before and after its handler call
//! (sequential dispatch per [`crate::saga_coordinator::dispatch`] makes this
//! exact for a single saga handler per message; a plain handler and a saga
//! handler sharing one message and both sending would misattribute the
//! plain handler's sends to whichever saga runs first).

use crate::handler::{HandlerError, HandlerOutcome};
use crate::metrics::SagaMetrics;
use crate::saga_coordinator::SagaInvocation;
use rustbus_core::headers::{LogicalMessage, MSG_ID};
use rustbus_core::idempotency::{IdempotencyData, LogicalOutboxEntry};
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::{enqueue_outgoing, Outbox, TransportMessage, OUTGOING_MESSAGES_KEY};
use serde_json::Value;
use std::collections::HashMap;

const IDEMPOTENCY_FIELD: &str = "__idempotency";

fn read_idempotency(payload: &Value) -> IdempotencyData {
    payload
        .get(IDEMPOTENCY_FIELD)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn write_idempotency(payload: &mut Value, data: &IdempotencyData) {
    if let Value::Object(map) = payload {
        map.insert(
            IDEMPOTENCY_FIELD.to_string(),
            serde_json::to_value(data).unwrap_or(Value::Null),
        );
    }
}

fn outbox_snapshot(tx: &TransactionContext) -> HashMap<String, usize> {
    let outbox = tx.get_or_add(OUTGOING_MESSAGES_KEY, || Outbox::new(HashMap::new()));
    let guard = outbox.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.iter().map(|(dest, msgs)| (dest.clone(), msgs.len())).collect()
}

fn outbox_delta(tx: &TransactionContext, before: &HashMap<String, usize>) -> Vec<LogicalOutboxEntry> {
    let outbox = tx.get_or_add(OUTGOING_MESSAGES_KEY, || Outbox::new(HashMap::new()));
    let guard = outbox.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut delta = Vec::new();
    for (destination, messages) in guard.iter() {
        let start = before.get(destination).copied().unwrap_or(0);
        for message in messages.iter().skip(start) {
            delta.push(LogicalOutboxEntry::new(
                destination.clone(),
                message.headers.clone(),
                message.body.clone(),
            ));
        }
    }
    delta
}

fn replay_onto_outbox(tx: &TransactionContext, entries: &[LogicalOutboxEntry]) {
    for entry in entries {
        enqueue_outgoing(
            tx,
            &entry.destination,
            TransportMessage::new(entry.body.clone(), entry.headers.clone()),
        );
    }
}

/// Dispatch each saga invocation with idempotent suppression: a message id
/// already recorded in a saga's `IdempotencyData` replays its recorded
/// outgoing messages instead of re-running the handler.
///
/// # Errors
///
/// Returns [`HandlerError`] if a handler invocation fails; a failure aborts
/// the transaction the same way [`crate::saga_coordinator::dispatch`] does.
pub async fn dispatch_idempotent(
    invocations: &mut [SagaInvocation],
    message: &LogicalMessage,
    tx: &TransactionContext,
) -> Result<(), HandlerError> {
    let Some(msg_id) = message.headers.get(MSG_ID).cloned() else {
        // No message id to key on; fall back to always-run semantics.
        return crate::saga_coordinator::dispatch(invocations, message, tx).await;
    };

    for invocation in invocations.iter_mut() {
        let mut idempotency = read_idempotency(&invocation.data.payload);

        if idempotency.has_processed(&msg_id) {
            replay_onto_outbox(tx, idempotency.replay_for(&msg_id));
            invocation.outcome = Some(HandlerOutcome::Continue);
            SagaMetrics::record_idempotent_replay();
            continue;
        }

        let before = outbox_snapshot(tx);
        let outcome = invocation
            .handler
            .handle(message, &mut invocation.data.payload, tx)
            .await?;
        let produced = outbox_delta(tx, &before);

        idempotency.record(msg_id.clone(), produced);
        write_idempotency(&mut invocation.data.payload, &idempotency);
        invocation.outcome = Some(outcome);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SagaHandler;
    use futures::future::BoxFuture;
    use rustbus_core::saga::{CorrelationProperty, SagaData};
    use rustbus_core::transport::enqueue_outgoing;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    struct SendOnceSaga;
    impl SagaHandler for SendOnceSaga {
        fn saga_data_type(&self) -> &'static str {
            "Order"
        }
        fn correlation_properties(&self) -> &[CorrelationProperty] {
            &[]
        }
        fn initiates(&self, _message_type: &str) -> bool {
            true
        }
        fn handle<'a>(
            &'a self,
            _message: &'a LogicalMessage,
            _data: &'a mut Value,
            tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<HandlerOutcome, HandlerError>> {
            Box::pin(async move {
                enqueue_outgoing(tx, "confirmations", TransportMessage::new(b"ok".to_vec(), StdHashMap::new()));
                Ok(HandlerOutcome::Continue)
            })
        }
    }

    fn message_with_id(id: &str) -> LogicalMessage {
        let mut headers = StdHashMap::new();
        headers.insert(MSG_ID.to_string(), id.to_string());
        LogicalMessage::new(Vec::new(), headers)
    }

    #[tokio::test]
    async fn first_delivery_runs_handler_and_records_outgoing() {
        let tx = TransactionContext::new();
        let message = message_with_id("m1");
        let mut invocations = vec![SagaInvocation {
            handler: Arc::new(SendOnceSaga),
            data: SagaData::new_initial("s1".to_string(), "Order", serde_json::json!({})),
            is_new: true,
            outcome: None,
        }];

        dispatch_idempotent(&mut invocations, &message, &tx).await.unwrap();

        let idempotency = read_idempotency(&invocations[0].data.payload);
        assert!(idempotency.has_processed("m1"));
        assert_eq!(idempotency.replay_for("m1").len(), 1);
    }

    #[tokio::test]
    async fn redelivery_replays_without_rerunning_handler() {
        let tx1 = TransactionContext::new();
        let message = message_with_id("m1");
        let mut invocations = vec![SagaInvocation {
            handler: Arc::new(SendOnceSaga),
            data: SagaData::new_initial("s1".to_string(), "Order", serde_json::json!({})),
            is_new: true,
            outcome: None,
        }];
        dispatch_idempotent(&mut invocations, &message, &tx1).await.unwrap();

        let tx2 = TransactionContext::new();
        dispatch_idempotent(&mut invocations, &message, &tx2).await.unwrap();

        let outbox = tx2.get_or_add(OUTGOING_MESSAGES_KEY, || Outbox::new(StdHashMap::new()));
        let guard = outbox.lock().unwrap();
        assert_eq!(guard.get("confirmations").map(Vec::len), Some(1));
    }
}
