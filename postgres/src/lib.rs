//! # rustbus-postgres
//!
//! Relational reference backends for `rustbus-core`'s storage contracts:
//! a saga store with an OCC revision check and a correlation-indexed find,
//! a timeout store with lease-based due-message polling, and a dead-letter
//! inspection API for poison messages the worker scheduler gave up on.
//!
//! These mirror `rustbus-testing`'s in-memory stores contract-for-contract —
//! the same invariants (§4.K, §4.J, §7) apply, just backed by `sqlx`/Postgres
//! instead of a `Mutex<HashMap<..>>`. A deployment picks one or the other per
//! environment (tests vs. production), not both.
//!
//! ## Layout
//!
//! - [`saga_store`] — [`saga_store::PostgresSagaStorage`], `rustbus_core::saga::SagaStorage`.
//! - [`timeout_store`] — [`timeout_store::PostgresTimeoutManager`], `rustbus_core::timeout::TimeoutManager`.
//! - [`dead_letter_queue`] — [`dead_letter_queue::DeadLetterQueue`], operator inspection of poison messages.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod saga_store;
pub mod timeout_store;

pub use dead_letter_queue::{DeadLetterError, DeadLetterQueue, DlqStatus, FailedMessage};
pub use saga_store::PostgresSagaStorage;
pub use timeout_store::PostgresTimeoutManager;
