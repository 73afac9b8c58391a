//! # rustbus-runtime
//!
//! The engine that turns `rustbus-core`'s contracts into a running bus:
//! worker scheduler, incoming/outgoing pipeline steps, saga coordinator and
//! idempotent saga layer, retrier, circuit breaker, and the configuration
//! and metrics surfaces that tie them together.
//!
//! `rustbus-core` defines *what* a transport, serializer, saga store, and
//! pipeline step are; this crate supplies the one canonical way of running
//! them as a bus (§1, §4). A deployment assembles a [`bus::Bus`] from its
//! own transport/serializer/saga-store implementations (or the in-memory
//! ones in `rustbus-testing`, or the relational ones in `rustbus-postgres`)
//! plus this crate's scheduler and pipeline.
//!
//! ## Layout
//!
//! - [`bus`] — the `send`/`publish`/`reply`/`forward`/`defer` facade and the
//!   builder that assembles every collaborator into a running bus.
//! - [`config`] — [`config::BusConfig`], validated once at construction.
//! - [`worker`] — the receive-loop scheduler bounded by [`bottleneck`].
//! - [`pipeline`] — the canonical incoming/outgoing step orderings.
//! - [`handler`] — handler registration (`MessageHandler`, `SagaHandler`).
//! - [`saga_coordinator`] — correlation, dispatch, and OCC persistence.
//! - [`idempotent_saga`] — the opt-in `__idempotency` replay layer.
//! - [`retry`] — the fixed-schedule retrier a transport driver wraps calls in.
//! - [`circuit_breaker`] — an optional outer layer for a failing transport.
//! - [`router`] — reference `Router` implementations.
//! - [`timeout_poller`] — the background worker that re-sends due deferred
//!   messages.
//! - [`environment`] — production `Clock`/`IdGenerator` implementations.
//! - [`metrics`] — Prometheus metric registration and recording helpers.
//! - [`error`] — [`error::BusError`], the umbrella error for the bus/worker
//!   surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bottleneck;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod environment;
pub mod error;
pub mod handler;
pub mod idempotent_saga;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod saga_coordinator;
pub mod timeout_poller;
pub mod worker;

pub use bus::{Bus, BusBuilder};
pub use config::{BusConfig, BusConfigBuilder, ConfigError};
pub use error::BusError;
