//! The worker scheduler (§4.F): pumps messages off the transport under
//! bounded parallelism and drives the incoming pipeline for each one.
//!
//! Each worker is a single receive loop; [`WorkerPool`] owns `number_of_workers`
//! of them plus the shared [`AsyncBottleneck`] that enforces `max_parallelism`
//! across the whole pool, and coordinates graceful shutdown.

use crate::bottleneck::AsyncBottleneck;
use crate::config::BusConfig;
use crate::metrics::{TransportMetrics, WorkerMetrics};
use crate::pipeline::incoming::TRANSPORT_MESSAGE_KEY;
use crate::pipeline::IncomingPipeline;
use rustbus_core::pipeline::StepContext;
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// One receive loop: acquire an admission token, receive under a fresh
/// transaction, run the incoming pipeline, commit or abort, dispose,
/// release the token (§4.F).
struct Worker {
    id: usize,
    transport: Arc<dyn Transport>,
    pipeline: Arc<IncomingPipeline>,
    bottleneck: Arc<AsyncBottleneck>,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.stopping.load(Ordering::Relaxed) {
                break;
            }

            let token = match self.bottleneck.acquire().await {
                Ok(token) => token,
                Err(_) => break,
            };

            let tx = TransactionContext::new();
            match self.transport.receive(&tx).await {
                Ok(Some(transport_message)) => {
                    backoff = INITIAL_BACKOFF;
                    WorkerMetrics::record_received();
                    TransportMetrics::record_receive();

                    let ctx = StepContext::new();
                    ctx.insert(TRANSPORT_MESSAGE_KEY, transport_message);

                    match self.pipeline.run(&ctx, &tx).await {
                        Ok(()) => tx.commit().await,
                        Err(err) => {
                            tracing::warn!(
                                worker = self.id,
                                error = %err,
                                "incoming pipeline failed, aborting transaction"
                            );
                            rustbus_core::transport::record_error_detail(&tx, err.to_string());
                            tx.abort().await;
                        }
                    }
                    tx.dispose().await;
                }
                Ok(None) => {
                    tx.dispose().await;
                    drop(token);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                Err(err) => {
                    tracing::error!(worker = self.id, error = %err, "transport receive failed");
                    tx.abort().await;
                    tx.dispose().await;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }

            drop(token);
        }
    }
}

/// Owns `number_of_workers` [`Worker`] loops and the shared bottleneck that
/// bounds their combined parallelism, plus graceful shutdown coordination
/// (§4.F "Shutdown").
pub struct WorkerPool {
    stopping: Arc<AtomicBool>,
    bottleneck: Arc<AsyncBottleneck>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `config.number_of_workers` receive loops against `transport`,
    /// each running `pipeline` for every received message.
    #[must_use]
    pub fn start(
        config: &BusConfig,
        transport: Arc<dyn Transport>,
        pipeline: Arc<IncomingPipeline>,
    ) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let bottleneck = Arc::new(AsyncBottleneck::new(config.max_parallelism));

        let handles = (0..config.number_of_workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    transport: Arc::clone(&transport),
                    pipeline: Arc::clone(&pipeline),
                    bottleneck: Arc::clone(&bottleneck),
                    stopping: Arc::clone(&stopping),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            stopping,
            bottleneck,
            handles,
        }
    }

    /// Request shutdown and wait up to `grace` for every worker to finish
    /// its current message. Workers still running past `grace` are force-
    /// aborted, which cancels their in-flight transaction at its next
    /// await point (§4.F, §9 "Cancellation").
    pub async fn shutdown(mut self, grace: Duration) {
        self.stopping.store(true, Ordering::Relaxed);
        self.bottleneck.close();

        let mut handles = self.handles.drain(..).collect::<Vec<_>>();
        let joined = tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut())).await;
        if joined.is_err() {
            tracing::warn!("worker pool did not shut down within grace period, aborting stragglers");
            for handle in &handles {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
            futures::future::join_all(handles).await;
        }
    }

    /// Current number of messages being handled concurrently across the
    /// pool.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.bottleneck.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::pipeline::IncomingPipeline;
    use futures::future::BoxFuture;
    use rustbus_core::headers::TransportMessage;
    use rustbus_core::transport::TransportError;

    /// A transport whose `receive` never resolves, simulating a worker
    /// stuck mid-handler past the shutdown grace period.
    struct StuckTransport;

    impl Transport for StuckTransport {
        fn create_queue(&self, _address: &str) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn send(
            &self,
            _destination: &str,
            _message: TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn receive<'a>(
            &'a self,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<Option<TransportMessage>, TransportError>> {
            Box::pin(std::future::pending())
        }

        fn address(&self) -> Option<&str> {
            None
        }
    }

    #[tokio::test]
    async fn shutdown_force_aborts_workers_still_running_past_grace() {
        let config = BusConfig::builder()
            .number_of_workers(1)
            .max_parallelism(1)
            .build()
            .unwrap();
        let transport: Arc<dyn Transport> = Arc::new(StuckTransport);
        let pipeline = Arc::new(IncomingPipeline::new(vec![]));

        let pool = WorkerPool::start(&config, transport, pipeline);
        // Let the single worker acquire its token and block in `receive`.
        tokio::task::yield_now().await;

        // Without force-abort this would hang forever: the stuck worker never
        // observes the grace period elapsing on its own.
        tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown must return once the stuck worker is aborted, not hang forever");
    }
}
