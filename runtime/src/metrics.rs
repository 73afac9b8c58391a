//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the bus runtime's components:
//! - Transport send/receive
//! - Pipeline step execution
//! - Saga coordination and idempotency
//! - Worker scheduler admission (bottleneck)
//! - Retrier attempts
//!
//! # Example
//!
//! ```rust,no_run
//! use rustbus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start().await?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be installed or server cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this will fail
    /// with `MetricsError::Install`. In production, ensure this is only called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Transport metrics
    describe_counter!(
        "transport_messages_sent_total",
        "Total number of messages sent to a transport destination"
    );
    describe_counter!(
        "transport_messages_received_total",
        "Total number of messages received from a transport"
    );
    describe_counter!(
        "transport_send_errors_total",
        "Total number of transport send failures"
    );
    describe_histogram!(
        "transport_send_duration_seconds",
        "Time taken to send a batch of messages to a destination"
    );
    describe_counter!(
        "transport_dead_letters_total",
        "Total number of messages moved to a dead-letter queue after exhausting delivery attempts"
    );

    // Pipeline metrics
    describe_counter!(
        "pipeline_incoming_processed_total",
        "Total number of messages that ran through the incoming pipeline"
    );
    describe_counter!(
        "pipeline_incoming_errors_total",
        "Total number of incoming pipeline failures"
    );
    describe_histogram!(
        "pipeline_incoming_duration_seconds",
        "Time taken to run the incoming pipeline for one message"
    );
    describe_histogram!(
        "pipeline_step_duration_seconds",
        "Time taken by an individual pipeline step"
    );

    // Saga metrics
    describe_counter!(
        "saga_instances_created_total",
        "Total number of saga instances inserted"
    );
    describe_counter!(
        "saga_instances_completed_total",
        "Total number of saga instances deleted on completion"
    );
    describe_counter!(
        "saga_concurrency_conflicts_total",
        "Total number of optimistic concurrency conflicts on saga storage"
    );
    describe_counter!(
        "saga_idempotent_replays_total",
        "Total number of handler invocations skipped and replayed by the idempotency layer"
    );

    // Worker / bottleneck metrics
    describe_gauge!(
        "worker_in_flight_messages",
        "Current number of messages admitted past the parallelism bottleneck"
    );
    describe_counter!(
        "worker_messages_received_total",
        "Total number of messages received by worker loops"
    );

    // Retrier metrics
    describe_counter!(
        "retrier_attempts_total",
        "Total number of retrier attempts"
    );
    describe_counter!(
        "retrier_exhausted_total",
        "Total number of times the retrier exhausted its fixed backoff schedule"
    );

    // Circuit breaker metrics (optional transport wrapper)
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of calls rejected while the circuit was open"
    );
}

/// Transport metrics recorder.
pub struct TransportMetrics;

impl TransportMetrics {
    /// Record a successful send of `count` messages to one destination.
    pub fn record_send(count: usize, duration: Duration) {
        counter!("transport_messages_sent_total").increment(count as u64);
        histogram!("transport_send_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a received message.
    pub fn record_receive() {
        counter!("transport_messages_received_total").increment(1);
    }

    /// Record a send failure.
    pub fn record_send_error() {
        counter!("transport_send_errors_total").increment(1);
    }

    /// Record a message moved to a dead-letter queue after exhausting
    /// delivery attempts (§4.B). Transport implementations that cannot take
    /// a direct dependency on this crate (e.g. `rustbus-testing`) record the
    /// same metric name directly via the `metrics` crate's global recorder
    /// instead of calling this function.
    pub fn record_dead_letter() {
        counter!("transport_dead_letters_total").increment(1);
    }
}

/// Incoming pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record one full incoming pipeline run.
    pub fn record_incoming(duration: Duration) {
        counter!("pipeline_incoming_processed_total").increment(1);
        histogram!("pipeline_incoming_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an incoming pipeline failure.
    pub fn record_incoming_error() {
        counter!("pipeline_incoming_errors_total").increment(1);
    }

    /// Record one step's execution time.
    pub fn record_step(duration: Duration) {
        histogram!("pipeline_step_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Saga coordinator metrics recorder.
pub struct SagaMetrics;

impl SagaMetrics {
    /// Record a new saga instance created.
    pub fn record_created() {
        counter!("saga_instances_created_total").increment(1);
    }

    /// Record a saga instance deleted on completion.
    pub fn record_completed() {
        counter!("saga_instances_completed_total").increment(1);
    }

    /// Record an optimistic concurrency conflict.
    pub fn record_conflict() {
        counter!("saga_concurrency_conflicts_total").increment(1);
    }

    /// Record an idempotent replay (handler body skipped).
    pub fn record_idempotent_replay() {
        counter!("saga_idempotent_replays_total").increment(1);
    }
}

/// Worker scheduler / bottleneck metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record the current number of in-flight admitted messages.
    pub fn record_in_flight(count: usize) {
        gauge!("worker_in_flight_messages").set(count as f64);
    }

    /// Record a message received by a worker loop.
    pub fn record_received() {
        counter!("worker_messages_received_total").increment(1);
    }
}

/// Retrier metrics recorder.
pub struct RetrierMetrics;

impl RetrierMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retrier_attempts_total").increment(1);
    }

    /// Record exhausted backoff schedule.
    pub fn record_exhausted() {
        counter!("retrier_exhausted_total").increment(1);
    }
}

/// Circuit breaker metrics recorder (used by the optional transport wrapper).
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state. 0 = Closed, 1 = `HalfOpen`, 2 = Open.
    pub fn record_state(state: f64) {
        gauge!("circuit_breaker_state").set(state);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection() {
        counter!("circuit_breaker_rejections_total").increment(1);
    }
}
