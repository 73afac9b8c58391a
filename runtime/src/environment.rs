//! Production implementations of [`rustbus_core::environment`]'s ambient
//! effects. `rustbus-testing` carries the deterministic counterparts
//! (`FixedClock`, `SequentialIdGenerator`) used in tests.

use chrono::{DateTime, Utc};
use rustbus_core::environment::{Clock, IdGenerator};
use uuid::Uuid;

/// Wall-clock [`Clock`] backed by [`chrono::Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// [`IdGenerator`] producing random UUIDv4 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn uuid_ids_are_unique() {
        let gen = UuidIdGenerator;
        assert_ne!(gen.new_id(), gen.new_id());
    }
}
