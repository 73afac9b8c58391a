//! The saga coordinator (§4.K): correlates an incoming message to a saga
//! instance, invokes the saga handler against it, and persists the result
//! with optimistic concurrency control.
//!
//! Split from the pipeline steps that call into it
//! ([`crate::pipeline::incoming::LoadSagaDataStep`] and
//! [`crate::pipeline::incoming::SaveSagaDataStep`]) so the correlation and
//! persistence rules live in one place independent of where they're wired
//! into the pipeline.

use crate::handler::{HandlerOutcome, SagaHandler};
use crate::metrics::SagaMetrics;
use rustbus_core::headers::LogicalMessage;
use rustbus_core::saga::{correlation_values_for, SagaData, SagaError, SagaStorage};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while correlating or persisting saga state.
#[derive(Error, Debug, Clone)]
pub enum SagaCoordinatorError {
    /// The incoming message's correlation property had no value to extract.
    #[error("no correlation value extracted for saga type {0:?}")]
    NoCorrelationValue(String),

    /// No existing saga correlated and this handler cannot initiate one for
    /// this message type.
    #[error("message type {0:?} does not correlate to an existing saga and cannot initiate one")]
    NotInitiating(String),

    /// The saga store failed, or an optimistic concurrency conflict was not
    /// resolved within this invocation.
    #[error("saga storage error: {0}")]
    Storage(#[from] SagaError),
}

/// One saga handler's resolved instance for the current message: either a
/// freshly created (`is_new`) or an existing saga, carried through dispatch
/// and back into persistence.
pub struct SagaInvocation {
    /// The saga handler to invoke.
    pub handler: Arc<dyn SagaHandler>,
    /// The resolved saga data, mutated in place by the handler.
    pub data: SagaData,
    /// Whether `data` was just created (not yet persisted) for this message.
    pub is_new: bool,
    /// Set once [`dispatch`] has run; `None` beforehand.
    pub outcome: Option<HandlerOutcome>,
}

/// For each saga handler registered against `message.message_type()`,
/// resolve (or create) its saga instance (§4.K steps 1–2).
///
/// # Errors
///
/// Returns [`SagaCoordinatorError::Storage`] if a lookup fails, or
/// [`SagaCoordinatorError::NoCorrelationValue`] if a handler's correlation
/// extractor returns nothing for a message it's registered against.
pub async fn load_saga_data(
    sagas: &[Arc<dyn SagaHandler>],
    message: &LogicalMessage,
    storage: &dyn SagaStorage,
) -> Result<Vec<SagaInvocation>, SagaCoordinatorError> {
    let message_body: serde_json::Value = serde_json::from_slice(&message.body).unwrap_or(serde_json::Value::Null);
    let message_type = message.message_type().unwrap_or("").to_string();

    let mut invocations = Vec::with_capacity(sagas.len());

    for handler in sagas {
        let mut found = None;
        for property in handler.correlation_properties() {
            if property.message_type != message_type {
                continue;
            }
            let Some(value) = (property.extractor)(&message_body) else {
                continue;
            };
            if let Some(existing) = storage
                .find(&property.saga_data_type, &property.property_path, &value)
                .await?
            {
                found = Some(existing);
                break;
            }
        }

        let (data, is_new) = match found {
            Some(existing) => (existing, false),
            None if handler.initiates(&message_type) => {
                let id = Uuid::new_v4().to_string();
                (
                    SagaData::new_initial(id, handler.saga_data_type(), serde_json::json!({})),
                    true,
                )
            }
            None => continue,
        };

        invocations.push(SagaInvocation {
            handler: Arc::clone(handler),
            data,
            is_new,
            outcome: None,
        });
    }

    Ok(invocations)
}

/// Invoke each saga invocation's handler in order, recording its outcome
/// (§4.K step 2c).
pub async fn dispatch(
    invocations: &mut [SagaInvocation],
    message: &LogicalMessage,
    tx: &rustbus_core::transaction::TransactionContext,
) -> Result<(), crate::handler::HandlerError> {
    for invocation in invocations.iter_mut() {
        let outcome = invocation
            .handler
            .handle(message, &mut invocation.data.payload, tx)
            .await?;
        invocation.outcome = Some(outcome);
    }
    Ok(())
}

/// Persist every invocation's resulting state (§4.K step 2d, invariant: a
/// saga created and immediately completed is never written).
///
/// # Errors
///
/// Returns [`SagaCoordinatorError::Storage`] carrying
/// [`SagaError::ConcurrencyConflict`] if any invocation's store call lost a
/// race; the caller must abort the transaction so the message is
/// redelivered against fresh state.
pub async fn save_saga_data(
    invocations: Vec<SagaInvocation>,
    storage: &dyn SagaStorage,
) -> Result<(), SagaCoordinatorError> {
    for invocation in invocations {
        match invocation.outcome {
            Some(HandlerOutcome::MarkedComplete) => {
                if !invocation.is_new {
                    storage.delete(&invocation.data).await?;
                    SagaMetrics::record_completed();
                }
                // else: created and immediately completed, never persisted.
            }
            Some(HandlerOutcome::Continue) | None => {
                let correlations =
                    correlation_values_for(&invocation.data, invocation.handler.correlation_properties());
                if invocation.is_new {
                    storage.insert(&invocation.data, &correlations).await?;
                    SagaMetrics::record_created();
                } else {
                    storage.update(&invocation.data, &correlations).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use rustbus_core::saga::CorrelationProperty;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct InMemorySagaStore {
        rows: Mutex<HashMap<String, SagaData>>,
    }

    impl InMemorySagaStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
            }
        }
    }

    impl SagaStorage for InMemorySagaStore {
        fn find<'a>(
            &'a self,
            data_type: &'a str,
            property_path: &'a str,
            value: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<Option<SagaData>, SagaError>> {
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                let key = property_path.trim_start_matches('/');
                Ok(rows
                    .values()
                    .find(|row| {
                        row.data_type == data_type && row.payload.get(key) == Some(value)
                    })
                    .cloned())
            })
        }

        fn insert<'a>(
            &'a self,
            data: &'a SagaData,
            _correlations: &'a [rustbus_core::saga::CorrelationValue],
        ) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async move {
                let mut rows = self.rows.lock().unwrap();
                rows.insert(data.id.clone(), data.clone());
                Ok(())
            })
        }

        fn update<'a>(
            &'a self,
            data: &'a SagaData,
            _correlations: &'a [rustbus_core::saga::CorrelationValue],
        ) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async move {
                let mut rows = self.rows.lock().unwrap();
                let mut updated = data.clone();
                updated.revision += 1;
                rows.insert(data.id.clone(), updated);
                Ok(())
            })
        }

        fn delete<'a>(&'a self, data: &'a SagaData) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async move {
                self.rows.lock().unwrap().remove(&data.id);
                Ok(())
            })
        }
    }

    struct EchoSaga;
    impl SagaHandler for EchoSaga {
        fn saga_data_type(&self) -> &'static str {
            "Order"
        }
        fn correlation_properties(&self) -> &[CorrelationProperty] {
            &[]
        }
        fn initiates(&self, message_type: &str) -> bool {
            message_type == "Start"
        }
        fn handle<'a>(
            &'a self,
            _message: &'a LogicalMessage,
            _data: &'a mut serde_json::Value,
            _tx: &'a rustbus_core::transaction::TransactionContext,
        ) -> BoxFuture<'a, Result<HandlerOutcome, crate::handler::HandlerError>> {
            Box::pin(async { Ok(HandlerOutcome::Continue) })
        }
    }

    #[tokio::test]
    async fn new_saga_that_completes_immediately_is_never_persisted() {
        let store = InMemorySagaStore::new();
        let invocation = SagaInvocation {
            handler: Arc::new(EchoSaga),
            data: SagaData::new_initial("id-1".to_string(), "Order", serde_json::json!({})),
            is_new: true,
            outcome: Some(HandlerOutcome::MarkedComplete),
        };

        save_saga_data(vec![invocation], &store).await.unwrap();

        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_saga_marked_complete_is_deleted() {
        let store = InMemorySagaStore::new();
        let data = SagaData::new_initial("id-2".to_string(), "Order", serde_json::json!({}));
        store.rows.lock().unwrap().insert(data.id.clone(), data.clone());

        let invocation = SagaInvocation {
            handler: Arc::new(EchoSaga),
            data,
            is_new: false,
            outcome: Some(HandlerOutcome::MarkedComplete),
        };

        save_saga_data(vec![invocation], &store).await.unwrap();

        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_saga_that_continues_is_inserted() {
        let store = InMemorySagaStore::new();
        let invocation = SagaInvocation {
            handler: Arc::new(EchoSaga),
            data: SagaData::new_initial("id-3".to_string(), "Order", serde_json::json!({})),
            is_new: true,
            outcome: Some(HandlerOutcome::Continue),
        };

        save_saga_data(vec![invocation], &store).await.unwrap();

        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }
}
