//! Dependency-injection traits for the ambient effects every component
//! needs: current time and id generation. Production code wires in
//! system-backed implementations; tests wire in deterministic ones.

use chrono::{DateTime, Utc};

/// Abstracts time so components can be tested with deterministic clocks.
///
/// ```ignore
/// struct SystemClock;
/// impl Clock for SystemClock {
///     fn now(&self) -> DateTime<Utc> { Utc::now() }
/// }
/// ```
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Abstracts unique id generation (message ids, saga ids) so tests can
/// assert against deterministic sequences instead of random UUIDs.
pub trait IdGenerator: Send + Sync {
    /// Produce a new unique id.
    fn new_id(&self) -> String;
}
