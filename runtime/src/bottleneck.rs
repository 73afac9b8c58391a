//! Admission control for the worker scheduler: `maxParallelism` caps
//! concurrent in-flight messages system-wide, independent of
//! `numberOfWorkers` (§5).
//!
//! A worker acquires a [`BottleneckToken`] before running the incoming
//! pipeline for a received message and holds it for the pipeline's duration;
//! dropping the token releases the slot, the same RAII release idiom the
//! [`crate::circuit_breaker`] half-open probe uses for its success/failure
//! bookkeeping.

use crate::metrics::WorkerMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, Semaphore};

/// Bounds the number of messages concurrently past admission, regardless of
/// how many worker loops are receiving.
#[derive(Clone)]
pub struct AsyncBottleneck {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl AsyncBottleneck {
    /// Create a bottleneck admitting at most `max_parallelism` messages at
    /// once.
    #[must_use]
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallelism)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot and return a token holding it. The slot is
    /// released when the token is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the bottleneck has been closed (shutdown).
    pub async fn acquire(&self) -> Result<BottleneckToken, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        WorkerMetrics::record_in_flight(count);
        Ok(BottleneckToken {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// The number of messages currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Close the bottleneck: any pending or future `acquire` calls fail.
    /// Used during graceful shutdown so stuck workers stop admitting new
    /// work.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Holds one admitted slot. Releases it on drop.
pub struct BottleneckToken {
    _permit: tokio::sync::OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BottleneckToken {
    fn drop(&mut self) {
        let count = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        WorkerMetrics::record_in_flight(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_bounds_concurrent_admission() {
        let bottleneck = AsyncBottleneck::new(2);
        let t1 = bottleneck.acquire().await.unwrap();
        let t2 = bottleneck.acquire().await.unwrap();
        assert_eq!(bottleneck.in_flight(), 2);

        drop(t1);
        assert_eq!(bottleneck.in_flight(), 1);
        drop(t2);
        assert_eq!(bottleneck.in_flight(), 0);
    }

    #[tokio::test]
    async fn a_third_acquire_waits_until_a_slot_is_released() {
        let bottleneck = AsyncBottleneck::new(1);
        let token = bottleneck.acquire().await.unwrap();

        let bottleneck2 = bottleneck.clone();
        let waiting = tokio::spawn(async move { bottleneck2.acquire().await });

        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(token);
        let second = waiting.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn close_causes_pending_acquire_to_error() {
        let bottleneck = AsyncBottleneck::new(0);
        bottleneck.close();
        assert!(bottleneck.acquire().await.is_err());
    }
}
