//! The umbrella error returned by the worker/bus surface, unifying every
//! component error behind one type so a caller driving [`crate::worker`]
//! doesn't need to match on each collaborator's error enum separately.

use rustbus_core::pipeline::PipelineError;
use rustbus_core::router::RoutingError;
use rustbus_core::saga::SagaError;
use rustbus_core::serializer::FormatError;
use rustbus_core::subscription::SubscriptionError;
use rustbus_core::timeout::TimeoutStoreError;
use rustbus_core::transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::handler::HandlerError;
use crate::saga_coordinator::SagaCoordinatorError;

/// Errors surfaced by the bus/worker layer.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// The bus configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The transport failed to send, receive, or settle a delivery.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A pipeline step failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A handler invocation failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Saga correlation or persistence failed.
    #[error(transparent)]
    SagaCoordinator(#[from] SagaCoordinatorError),

    /// The saga store failed directly (outside the coordinator, e.g. during
    /// idempotent-saga replay bookkeeping).
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// Routing a message to its destination failed.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Serialization or deserialization failed.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The timeout store failed.
    #[error(transparent)]
    Timeout(#[from] TimeoutStoreError),

    /// A subscription registration or lookup failed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// No subscription storage was configured for this bus.
    #[error("no subscription storage configured for this bus")]
    NoSubscriptionStorage,
}
