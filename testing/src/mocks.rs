//! Deterministic `Clock`/`IdGenerator` test doubles (§3 "Environment").
//!
//! Production code wires in `rustbus_runtime::environment`'s system-backed
//! implementations; tests wire these in instead so assertions can pin down
//! exact timestamps and ids rather than tolerating whatever `Utc::now()` or
//! `Uuid::new_v4()` happens to produce.

use chrono::{DateTime, Utc};
use rustbus_core::environment::{Clock, IdGenerator};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed clock for deterministic tests.
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use rustbus_testing::mocks::FixedClock;
/// use rustbus_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// let time1 = clock.now();
/// let time2 = clock.now();
/// assert_eq!(time1, time2);
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Panics if the hardcoded timestamp fails to parse, which should never
/// happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

/// Predictable id generator for tests: `"id-1"`, `"id-2"`, ... in call order.
///
/// # Example
///
/// ```
/// use rustbus_testing::mocks::SequentialIdGenerator;
/// use rustbus_core::environment::IdGenerator;
///
/// let ids = SequentialIdGenerator::new();
/// assert_eq!(ids.new_id(), "id-1");
/// assert_eq!(ids.new_id(), "id-2");
/// ```
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Create a generator starting at `"id-1"`.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn new_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("id-{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_always_returns_same_time() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn sequential_ids_increase_in_call_order() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.new_id(), "id-1");
        assert_eq!(ids.new_id(), "id-2");
        assert_eq!(ids.new_id(), "id-3");
    }
}
