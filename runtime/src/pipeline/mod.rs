//! Concrete pipeline step implementations and the runner that chains them
//! (§4.C).
//!
//! [`rustbus_core::pipeline`] defines the `IncomingStep`/`OutgoingStep`
//! contracts and the per-message [`rustbus_core::pipeline::StepContext`];
//! this module supplies the canonical step orderings the spec names and the
//! driver that folds a step list into a single `next`-chained call.

pub mod incoming;
pub mod outgoing;

use crate::metrics::PipelineMetrics;
use futures::future::BoxFuture;
use rustbus_core::pipeline::{IncomingStep, OutgoingStep, PipelineError, StepContext};
use rustbus_core::transaction::TransactionContext;
use std::time::Instant;

/// An ordered, immutable list of incoming steps, run by folding `next`
/// continuations from the last step back to the first.
pub struct IncomingPipeline {
    steps: Vec<Box<dyn IncomingStep>>,
}

impl IncomingPipeline {
    /// Build a pipeline from steps in the order they should run.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn IncomingStep>>) -> Self {
        Self { steps }
    }

    /// Run every step against `ctx`/`tx`. A step that never calls `next`
    /// short-circuits everything after it (§4.C step 2: deferred messages).
    pub async fn run(&self, ctx: &StepContext, tx: &TransactionContext) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = run_chain(&self.steps, 0, ctx, tx).await;
        PipelineMetrics::record_incoming(started.elapsed());
        if result.is_err() {
            PipelineMetrics::record_incoming_error();
        }
        result
    }
}

fn run_chain<'a>(
    steps: &'a [Box<dyn IncomingStep>],
    index: usize,
    ctx: &'a StepContext,
    tx: &'a TransactionContext,
) -> BoxFuture<'a, Result<(), PipelineError>> {
    Box::pin(async move {
        let Some(step) = steps.get(index) else {
            return Ok(());
        };
        let next: rustbus_core::pipeline::NextFn<'a> =
            Box::new(move || run_chain(steps, index + 1, ctx, tx));
        let started = Instant::now();
        let result = step.invoke(ctx, tx, next).await;
        PipelineMetrics::record_step(started.elapsed());
        result
    })
}

/// An ordered, immutable list of outgoing steps, run the same way as
/// [`IncomingPipeline`].
pub struct OutgoingPipeline {
    steps: Vec<Box<dyn OutgoingStep>>,
}

impl OutgoingPipeline {
    /// Build a pipeline from steps in the order they should run.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn OutgoingStep>>) -> Self {
        Self { steps }
    }

    /// Run every step against `ctx`/`tx`.
    pub async fn run(&self, ctx: &StepContext, tx: &TransactionContext) -> Result<(), PipelineError> {
        run_outgoing_chain(&self.steps, 0, ctx, tx).await
    }
}

fn run_outgoing_chain<'a>(
    steps: &'a [Box<dyn OutgoingStep>],
    index: usize,
    ctx: &'a StepContext,
    tx: &'a TransactionContext,
) -> BoxFuture<'a, Result<(), PipelineError>> {
    Box::pin(async move {
        let Some(step) = steps.get(index) else {
            return Ok(());
        };
        let next: rustbus_core::pipeline::NextFn<'a> =
            Box::new(move || run_outgoing_chain(steps, index + 1, ctx, tx));
        let started = Instant::now();
        let result = step.invoke(ctx, tx, next).await;
        PipelineMetrics::record_step(started.elapsed());
        result
    })
}
