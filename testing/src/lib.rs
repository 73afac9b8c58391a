//! # rustbus-testing
//!
//! In-memory reference backends for every `rustbus-core` contract, plus the
//! deterministic `Clock`/`IdGenerator` test doubles used throughout the
//! runtime's own test suite.
//!
//! These are reference implementations, not stubs: [`transport::InMemoryTransport`]
//! instances sharing a [`transport::InMemoryNetwork`] honor the same
//! peek-lock contract a real broker driver must, and [`saga_store::InMemorySagaStorage`]
//! enforces the same optimistic-concurrency revision check a relational
//! store would. Tests built against this crate exercise real contract
//! semantics, not stubbed-out happy paths.
//!
//! ## Example
//!
//! ```
//! use rustbus_testing::mocks::test_clock;
//! use rustbus_core::environment::Clock;
//!
//! let clock = test_clock();
//! assert_eq!(clock.now(), clock.now());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod mocks;
pub mod saga_store;
pub mod serializer;
pub mod subscription_store;
pub mod timeout_store;
pub mod transport;

pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};
pub use saga_store::InMemorySagaStorage;
pub use serializer::JsonSerializer;
pub use subscription_store::InMemorySubscriptionStorage;
pub use timeout_store::InMemoryTimeoutManager;
pub use transport::{InMemoryNetwork, InMemoryTransport};
