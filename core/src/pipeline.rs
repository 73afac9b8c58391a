//! The pipeline engine contract: ordered, composable steps over an
//! immutable-shape step context (§4.C).
//!
//! A pipeline is an ordered list of steps. Each step receives a
//! [`StepContext`] (a keyed item bag, analogous to [`TransactionContext`]'s
//! item bag but scoped to one message) and a `next` continuation; the step
//! performs work, optionally calls `next`, then optionally performs
//! post-work — the familiar middleware pattern. Two pipelines exist:
//! incoming and outgoing, distinguished only by the marker traits
//! [`IncomingStep`] and [`OutgoingStep`] so the two orderings can't be mixed
//! up at the call site.
//!
//! Invariant: steps must not hide errors from `next` — propagating an error
//! up the stack aborts the transaction (§4.C).

use crate::transaction::TransactionContext;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by a pipeline step. Any variant here propagating out of
/// [`Pipeline::run`](crate::pipeline) (re-exported by `rustbus_runtime`)
/// aborts the owning transaction.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// The message body could not be deserialized into a logical message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The content type on the transport message is not understood.
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    /// No step further down the chain produced a usable outcome and none
    /// was expected to short-circuit.
    #[error("routing failed: {0}")]
    Routing(String),

    /// A handler invocation failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Saga persistence failed (wraps a concurrency conflict or a storage
    /// error from the saga layer).
    #[error("saga persistence failed: {0}")]
    Saga(String),

    /// A step-specific failure not covered by a more specific variant.
    #[error("pipeline step failed: {0}")]
    Other(String),
}

/// A keyed item bag scoped to a single pipeline invocation (one message).
///
/// Distinct from [`TransactionContext`]'s item bag: this one is thrown away
/// once the pipeline finishes running for a message, while the transaction
/// context's bag (and its callback lists) may outlive an individual pipeline
/// run until commit/abort.
#[derive(Default)]
pub struct StepContext {
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl StepContext {
    /// Create an empty step context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(value));
    }

    /// Fetch the value stored under `key`, if any, downcast to `T`.
    ///
    /// # Panics
    ///
    /// Panics if a value is stored under `key` with a different type than
    /// `T`.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .map(|v| {
                Arc::clone(v)
                    .downcast::<T>()
                    .unwrap_or_else(|_| panic!("step item {key:?} stored under a conflicting type"))
            })
    }

    /// Fetch the value stored under `key`, or insert `factory`'s result.
    pub fn get_or_add<T, F>(&self, key: &str, factory: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = items
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(factory()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(entry)
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("step item {key:?} stored under a conflicting type"))
    }
}

/// The continuation passed to a step: calling it runs every step after this
/// one. A step that never calls `next` short-circuits the remainder of the
/// pipeline (used by e.g. the deferred-message step, §4.C step 2).
pub type NextFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), PipelineError>> + Send + 'a>;

/// One step of the incoming (receive-side) pipeline.
pub trait IncomingStep: Send + Sync {
    /// Run this step. Call `next` to continue down the chain; omit the call
    /// to short-circuit.
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;

    /// A short, stable name used in tracing spans and error messages.
    fn name(&self) -> &'static str;
}

/// One step of the outgoing (send-side) pipeline.
pub trait OutgoingStep: Send + Sync {
    /// Run this step. Call `next` to continue down the chain.
    fn invoke<'a>(
        &'a self,
        ctx: &'a StepContext,
        tx: &'a TransactionContext,
        next: NextFn<'a>,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;

    /// A short, stable name used in tracing spans and error messages.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_context_get_or_add_is_stable_across_calls() {
        let ctx = StepContext::new();
        let first = ctx.get_or_add("n", || 7i32);
        let second = ctx.get_or_add("n", || 0i32);
        assert_eq!(*first, 7);
        assert_eq!(*second, 7);
    }

    #[test]
    fn step_context_insert_overwrites() {
        let ctx = StepContext::new();
        ctx.insert("k", 1i32);
        ctx.insert("k", 2i32);
        assert_eq!(*ctx.get::<i32>("k").unwrap(), 2);
    }

    #[test]
    fn step_context_get_missing_key_is_none() {
        let ctx = StepContext::new();
        assert!(ctx.get::<i32>("missing").is_none());
    }
}
