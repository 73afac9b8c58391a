//! Handler registration: plain message handlers and saga handlers, and the
//! registry ("handler activator") that resolves both for an incoming
//! message type (§4.C step 3, §4.K).

use futures::future::BoxFuture;
use rustbus_core::headers::LogicalMessage;
use rustbus_core::saga::CorrelationProperty;
use rustbus_core::transaction::TransactionContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a handler body can fail with. Any error here aborts the owning
/// transaction and lets the transport redeliver the message.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The handler's business logic failed.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// What a saga handler decided to do with its data after running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep the saga instance (insert if new, otherwise update).
    Continue,
    /// The saga marked itself complete (`MarkAsComplete`); delete it unless
    /// it was never persisted (§4.K invariant: a saga created and
    /// immediately completed is never written).
    MarkedComplete,
}

/// A handler with no saga affiliation: stateless with respect to the saga
/// store, invoked once per matching message.
pub trait MessageHandler: Send + Sync {
    /// The logical message type (`rbs2-msg-type`) this handler processes.
    fn message_type(&self) -> &'static str;

    /// Handle one message under the current transaction.
    fn handle<'a>(
        &'a self,
        message: &'a LogicalMessage,
        tx: &'a TransactionContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// A handler whose invocations are scoped to a correlated saga instance.
///
/// `data` is the saga's JSON-encoded payload (the coordinator owns loading
/// and persisting it around the call); the handler mutates it in place and
/// signals completion via the returned [`HandlerOutcome`].
pub trait SagaHandler: Send + Sync {
    /// The saga data type this handler's instances are stored under.
    fn saga_data_type(&self) -> &'static str;

    /// The correlation properties registered for this saga's message types.
    fn correlation_properties(&self) -> &[CorrelationProperty];

    /// Whether this handler can *initiate* a new saga instance for
    /// `message_type` when no existing instance correlates.
    fn initiates(&self, message_type: &str) -> bool;

    /// Handle one message against the saga instance's payload.
    fn handle<'a>(
        &'a self,
        message: &'a LogicalMessage,
        data: &'a mut Value,
        tx: &'a TransactionContext,
    ) -> BoxFuture<'a, Result<HandlerOutcome, HandlerError>>;
}

/// Registry mapping a logical message type to the handlers (plain and saga)
/// that should run for it, in registration order.
///
/// Invariant (§4.C step 5): all handlers for one message run sequentially in
/// registration order on the same logical thread of control.
#[derive(Default)]
pub struct HandlerActivator {
    plain: HashMap<&'static str, Vec<Arc<dyn MessageHandler>>>,
    saga: HashMap<String, Vec<Arc<dyn SagaHandler>>>,
}

impl HandlerActivator {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain handler for its declared message type.
    pub fn register_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.plain
            .entry(handler.message_type())
            .or_default()
            .push(handler);
    }

    /// Register a saga handler for every message type named by its
    /// correlation properties.
    pub fn register_saga(&mut self, handler: Arc<dyn SagaHandler>) {
        let message_types: Vec<String> = handler
            .correlation_properties()
            .iter()
            .map(|p| p.message_type.clone())
            .collect();
        for message_type in message_types {
            self.saga
                .entry(message_type)
                .or_default()
                .push(Arc::clone(&handler));
        }
    }

    /// Plain handlers registered for `message_type`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, message_type: &str) -> &[Arc<dyn MessageHandler>] {
        self.plain.get(message_type).map_or(&[], Vec::as_slice)
    }

    /// Saga handlers registered for `message_type`, in registration order.
    #[must_use]
    pub fn sagas_for(&self, message_type: &str) -> &[Arc<dyn SagaHandler>] {
        self.saga.get(message_type).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    impl MessageHandler for NoopHandler {
        fn message_type(&self) -> &'static str {
            "Noop"
        }
        fn handle<'a>(
            &'a self,
            _message: &'a LogicalMessage,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn registered_handler_is_found_by_message_type() {
        let mut activator = HandlerActivator::new();
        activator.register_handler(Arc::new(NoopHandler));
        assert_eq!(activator.handlers_for("Noop").len(), 1);
        assert!(activator.handlers_for("Other").is_empty());
    }
}
