//! The canonical incoming pipeline steps (§4.C): deserialize, honor
//! deferred-until, activate handlers, load saga data, dispatch, save saga
//! data. Flushing the outbox is not a step here — it happens when the
//! worker commits the transaction (§4.A).

use crate::handler::{HandlerActivator, MessageHandler, SagaHandler};
use crate::saga_coordinator::{self, SagaCoordinatorError, SagaInvocation};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rustbus_core::environment::Clock;
use rustbus_core::headers::{LogicalMessage, TransportMessage, DEFERRED_UNTIL};
use rustbus_core::pipeline::{IncomingStep, NextFn, PipelineError, StepContext};
use rustbus_core::saga::SagaStorage;
use rustbus_core::serializer::Serializer;
use rustbus_core::timeout::TimeoutManager;
use rustbus_core::transaction::TransactionContext;
use std::sync::{Arc, Mutex};

/// Item-bag key the worker stores the just-received [`TransportMessage`]
/// under before running the incoming pipeline.
pub const TRANSPORT_MESSAGE_KEY: &str = "transport-message";
/// Item-bag key [`DeserializeStep`] stores the deserialized
/// [`LogicalMessage`] under.
pub const LOGICAL_MESSAGE_KEY: &str = "logical-message";
/// Item-bag key [`ActivateHandlersStep`] stores the resolved plain handlers
/// under.
pub const PLAIN_HANDLERS_KEY: &str = "plain-handlers";
/// Item-bag key [`ActivateHandlersStep`] stores the resolved saga handlers
/// under.
pub const SAGA_HANDLERS_KEY: &str = "saga-handlers";
/// Item-bag key [`LoadSagaDataStep`]/[`SaveSagaDataStep`] share the loaded
/// [`SagaInvocation`] list under.
pub const SAGA_INVOCATIONS_KEY: &str = "saga-invocations";

/// `TransportMessage → LogicalMessage` (§4.C step 1).
pub struct DeserializeStep {
    serializer: Arc<dyn Serializer>,
}

impl DeserializeStep {
    /// Build the step over a serializer.
    #[must_use]
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

impl IncomingStep for DeserializeStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let transport_message = ctx
                .get::<TransportMessage>(TRANSPORT_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no transport message in context".to_string()))?;
            let logical = self
                .serializer
                .deserialize((*transport_message).clone())
                .await
                .map_err(|e| PipelineError::Deserialization(e.to_string()))?;
            ctx.insert(LOGICAL_MESSAGE_KEY, logical);
            next().await?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "DeserializeStep"
    }
}

/// If `rbs2-deferred-until` names a time still in the future, re-defer via
/// the timeout manager and short-circuit the rest of the pipeline (§4.C
/// step 2).
pub struct HandleDeferredMessagesStep {
    timeouts: Arc<dyn TimeoutManager>,
    clock: Arc<dyn Clock>,
}

impl HandleDeferredMessagesStep {
    /// Build the step over a timeout manager and clock.
    #[must_use]
    pub fn new(timeouts: Arc<dyn TimeoutManager>, clock: Arc<dyn Clock>) -> Self {
        Self { timeouts, clock }
    }
}

impl IncomingStep for HandleDeferredMessagesStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let logical = ctx
                .get::<LogicalMessage>(LOGICAL_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no logical message in context".to_string()))?;

            if let Some(raw) = logical.headers.get(DEFERRED_UNTIL) {
                if let Ok(due) = DateTime::parse_from_rfc3339(raw) {
                    let due: DateTime<Utc> = due.with_timezone(&Utc);
                    if due > self.clock.now() {
                        self.timeouts
                            .defer(due, logical.headers.clone(), logical.body.clone())
                            .await
                            .map_err(|e| PipelineError::Other(e.to_string()))?;
                        return Ok(());
                    }
                }
            }

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "HandleDeferredMessagesStep"
    }
}

/// Resolve the plain and saga handlers registered for the message's type
/// (§4.C step 3).
pub struct ActivateHandlersStep {
    activator: Arc<HandlerActivator>,
}

impl ActivateHandlersStep {
    /// Build the step over a handler registry.
    #[must_use]
    pub fn new(activator: Arc<HandlerActivator>) -> Self {
        Self { activator }
    }
}

impl IncomingStep for ActivateHandlersStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let logical = ctx
                .get::<LogicalMessage>(LOGICAL_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no logical message in context".to_string()))?;
            let message_type = logical.message_type().unwrap_or("");

            let plain: Vec<Arc<dyn MessageHandler>> =
                self.activator.handlers_for(message_type).to_vec();
            let sagas: Vec<Arc<dyn SagaHandler>> = self.activator.sagas_for(message_type).to_vec();

            ctx.insert(PLAIN_HANDLERS_KEY, plain);
            ctx.insert(SAGA_HANDLERS_KEY, sagas);

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "ActivateHandlersStep"
    }
}

/// Correlate (or create) a saga instance for each registered saga handler
/// (§4.C step 4, §4.K).
pub struct LoadSagaDataStep {
    storage: Arc<dyn SagaStorage>,
}

impl LoadSagaDataStep {
    /// Build the step over a saga store.
    #[must_use]
    pub fn new(storage: Arc<dyn SagaStorage>) -> Self {
        Self { storage }
    }
}

impl IncomingStep for LoadSagaDataStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let logical = ctx
                .get::<LogicalMessage>(LOGICAL_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no logical message in context".to_string()))?;
            let sagas = ctx
                .get::<Vec<Arc<dyn SagaHandler>>>(SAGA_HANDLERS_KEY)
                .ok_or_else(|| PipelineError::Other("saga handlers not activated".to_string()))?;

            let invocations = saga_coordinator::load_saga_data(&sagas, &logical, self.storage.as_ref())
                .await
                .map_err(saga_error_to_pipeline)?;

            ctx.insert(SAGA_INVOCATIONS_KEY, Mutex::new(invocations));
            next().await
        })
    }

    fn name(&self) -> &'static str {
        "LoadSagaDataStep"
    }
}

/// Invoke every plain handler, then every saga invocation, in registration
/// order (§4.C step 5).
///
/// When built with `idempotent: true` (§6 `enable_idempotent_sagas`), saga
/// dispatch runs through [`crate::idempotent_saga::dispatch_idempotent`]
/// instead of [`saga_coordinator::dispatch`], suppressing a handler re-run
/// for a message id a saga has already processed and replaying its recorded
/// outbox entries instead (§4.L).
pub struct DispatchIncomingMessageStep {
    idempotent: bool,
}

impl DispatchIncomingMessageStep {
    /// Build the step. `idempotent` mirrors
    /// [`crate::config::BusConfig::enable_idempotent_sagas`].
    #[must_use]
    pub fn new(idempotent: bool) -> Self {
        Self { idempotent }
    }
}

impl IncomingStep for DispatchIncomingMessageStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let logical = ctx
                .get::<LogicalMessage>(LOGICAL_MESSAGE_KEY)
                .ok_or_else(|| PipelineError::Other("no logical message in context".to_string()))?;
            let plain = ctx
                .get::<Vec<Arc<dyn MessageHandler>>>(PLAIN_HANDLERS_KEY)
                .ok_or_else(|| PipelineError::Other("handlers not activated".to_string()))?;

            for handler in plain.iter() {
                handler
                    .handle(&logical, tx)
                    .await
                    .map_err(|e| PipelineError::Handler(e.to_string()))?;
            }

            if let Some(invocations_lock) = ctx.get::<Mutex<Vec<SagaInvocation>>>(SAGA_INVOCATIONS_KEY) {
                let mut invocations = invocations_lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if self.idempotent {
                    crate::idempotent_saga::dispatch_idempotent(&mut invocations, &logical, tx)
                        .await
                        .map_err(|e| PipelineError::Handler(e.to_string()))?;
                } else {
                    saga_coordinator::dispatch(&mut invocations, &logical, tx)
                        .await
                        .map_err(|e| PipelineError::Handler(e.to_string()))?;
                }
            }

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "DispatchIncomingMessageStep"
    }
}

/// Persist every saga invocation's resulting state (§4.C step 6, §4.K step
/// 2d/3).
pub struct SaveSagaDataStep {
    storage: Arc<dyn SagaStorage>,
}

impl SaveSagaDataStep {
    /// Build the step over a saga store.
    #[must_use]
    pub fn new(storage: Arc<dyn SagaStorage>) -> Self {
        Self { storage }
    }
}

impl IncomingStep for SaveSagaDataStep {
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        _tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if let Some(invocations_lock) = ctx.get::<Mutex<Vec<SagaInvocation>>>(SAGA_INVOCATIONS_KEY) {
                let invocations = std::mem::take(
                    &mut *invocations_lock
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner),
                );
                saga_coordinator::save_saga_data(invocations, self.storage.as_ref())
                    .await
                    .map_err(saga_error_to_pipeline)?;
            }

            next().await
        })
    }

    fn name(&self) -> &'static str {
        "SaveSagaDataStep"
    }
}

fn saga_error_to_pipeline(err: SagaCoordinatorError) -> PipelineError {
    PipelineError::Saga(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustbus_core::headers::MSG_TYPE;
    use std::collections::HashMap;

    struct PassthroughSerializer;
    impl Serializer for PassthroughSerializer {
        fn serialize(
            &self,
            message: LogicalMessage,
        ) -> BoxFuture<'_, Result<TransportMessage, rustbus_core::serializer::FormatError>> {
            Box::pin(async move { Ok(TransportMessage::new(message.body, message.headers)) })
        }
        fn deserialize(
            &self,
            message: TransportMessage,
        ) -> BoxFuture<'_, Result<LogicalMessage, rustbus_core::serializer::FormatError>> {
            Box::pin(async move { Ok(LogicalMessage::new(message.body, message.headers)) })
        }
    }

    #[tokio::test]
    async fn deserialize_step_populates_logical_message() {
        let ctx = StepContext::new();
        let tx = TransactionContext::new();
        let mut headers = HashMap::new();
        headers.insert(MSG_TYPE.to_string(), "Ping".to_string());
        ctx.insert(TRANSPORT_MESSAGE_KEY, TransportMessage::new(b"hi".to_vec(), headers));

        let step = DeserializeStep::new(Arc::new(PassthroughSerializer));
        step.invoke(&ctx, &tx, Box::new(|| Box::pin(async { Ok(()) })))
            .await
            .unwrap();

        let logical = ctx.get::<LogicalMessage>(LOGICAL_MESSAGE_KEY).unwrap();
        assert_eq!(logical.body, b"hi");
        assert_eq!(logical.message_type(), Some("Ping"));
    }
}
