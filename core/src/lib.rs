//! # rustbus-core
//!
//! Core contracts for a Rebus-style service bus: the traits and data types
//! every transport, serializer, router, and storage backend implements, plus
//! the transaction context and pipeline engine that tie them together.
//!
//! This crate defines *what* a bus needs from its collaborators. It ships no
//! concrete transport, serializer, or storage backend — those live in
//! `rustbus-runtime` (worker scheduler, pipeline step implementations, saga
//! coordinator), `rustbus-testing` (in-memory reference backends), and
//! `rustbus-postgres` (relational saga/timeout/dead-letter storage).
//!
//! ## Data flow
//!
//! On receive: a worker calls [`transport::Transport::receive`], the
//! incoming pipeline deserializes the body, routes it to handlers, loads and
//! saves saga state around each invocation, and buffers any outgoing
//! messages on the [`transaction::TransactionContext`] until commit. On
//! send: a handler enqueues via [`transport::enqueue_outgoing`]; the buffered
//! messages are flushed to the transport only when the transaction commits.
//!
//! ## Core concepts
//!
//! - [`headers::TransportMessage`] / [`headers::LogicalMessage`]: the wire
//!   and logical message shapes, joined by the reserved `rbs2-*` headers.
//! - [`transaction::TransactionContext`]: per-message scratch space with an
//!   item bag and ordered commit/abort/completed/disposed callback lists.
//! - [`pipeline`]: ordered, composable incoming/outgoing steps over a
//!   per-message [`pipeline::StepContext`].
//! - [`transport::Transport`], [`serializer::Serializer`], [`router::Router`],
//!   [`subscription::SubscriptionStorage`]: the pluggable collaborators.
//! - [`saga::SagaStorage`] / [`saga::CorrelationProperty`]: saga persistence
//!   and message-to-saga correlation.
//! - [`idempotency::IdempotencyData`]: per-saga record of already-handled
//!   messages and their replayed side effects.
//! - [`timeout::TimeoutManager`]: deferred-message storage for delayed
//!   delivery.
//! - [`environment::Clock`] / [`environment::IdGenerator`]: injected ambient
//!   effects.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod environment;
pub mod headers;
pub mod idempotency;
pub mod pipeline;
pub mod router;
pub mod saga;
pub mod serializer;
pub mod subscription;
pub mod timeout;
pub mod transaction;
pub mod transport;

pub use environment::{Clock, IdGenerator};
pub use headers::{LogicalMessage, TransportMessage};
pub use idempotency::{IdempotencyData, LogicalOutboxEntry};
pub use pipeline::{IncomingStep, NextFn, OutgoingStep, PipelineError, StepContext};
pub use router::{Router, RoutingError};
pub use saga::{CorrelationProperty, SagaData, SagaError, SagaStorage};
pub use serializer::{FormatError, Serializer};
pub use subscription::{Subscription, SubscriptionError, SubscriptionStorage};
pub use timeout::{DueMessage, DueMessageBatch, TimeoutManager, TimeoutStoreError};
pub use transaction::{CallbackError, TransactionContext, TxState};
pub use transport::{LeaseHint, ReceiveMode, Transport, TransportError};
