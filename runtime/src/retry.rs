//! The retrier: wraps a transport call with the fixed Rebus backoff schedule
//! and a transient-error classifier (§4.A).
//!
//! Unlike a tunable exponential-backoff policy, the schedule here is a fixed
//! sequence of 13 delays (sum ≈ 24s); the 14th attempt either succeeds or
//! surfaces the last error. Any non-transient error is surfaced immediately
//! without consuming the remaining schedule.

use crate::metrics::RetrierMetrics;
use std::time::Duration;
use tokio::time::sleep;

/// The fixed backoff schedule, in seconds, applied between successive
/// attempts. 13 delays between 14 total attempts.
const BACKOFF_SCHEDULE_SECS: [f64; 13] = [
    0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.5, 1.0, 1.0, 1.0, 5.0, 5.0, 10.0,
];

/// Classifies whether an error is safe to retry without semantic risk.
pub trait TransientClassifier<E>: Send + Sync {
    /// Whether `err` is transient (safe to retry).
    fn is_transient(&self, err: &E) -> bool;
}

impl<E, F> TransientClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, err: &E) -> bool {
        self(err)
    }
}

/// Retries `operation` against the fixed Rebus backoff schedule, classifying
/// errors with `is_transient`.
///
/// On a non-transient error, or after the last scheduled attempt fails, the
/// most recent error is returned.
pub async fn retry_with_fixed_schedule<F, Fut, T, E, C>(
    mut operation: F,
    is_transient: &C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: TransientClassifier<E>,
{
    let mut attempt = 0usize;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "transport call succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_transient.is_transient(&err) {
                    tracing::warn!(error = %err, "non-transient error, surfacing immediately");
                    return Err(err);
                }

                let Some(&delay_secs) = BACKOFF_SCHEDULE_SECS.get(attempt) else {
                    tracing::error!(attempt, error = %err, "retrier exhausted fixed backoff schedule");
                    RetrierMetrics::record_exhausted();
                    return Err(err);
                };

                tracing::warn!(
                    attempt,
                    delay_secs,
                    error = %err,
                    "transient error, retrying per fixed schedule"
                );
                RetrierMetrics::record_attempt();
                sleep(Duration::from_secs_f64(delay_secs)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_schedule_has_fourteen_attempts_and_sums_to_about_24s() {
        assert_eq!(BACKOFF_SCHEDULE_SECS.len(), 13);
        let sum: f64 = BACKOFF_SCHEDULE_SECS.iter().sum();
        assert!((sum - 24.4).abs() < 0.01);
    }

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result = retry_with_fixed_schedule(
            || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(7)
                }
            },
            &|_: &String| true,
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transient_error_surfaces_without_retry() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result = retry_with_fixed_schedule(
            || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("fatal".to_string())
                }
            },
            &|_: &String| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result = retry_with_fixed_schedule(
            || {
                let c = Arc::clone(&c);
                async move {
                    let attempt = c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(99)
                    }
                }
            },
            &|_: &String| true,
        )
        .await;

        assert_eq!(result, Ok(99));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
