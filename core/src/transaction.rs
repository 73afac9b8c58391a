//! The unit-of-work for a single message: [`TransactionContext`].
//!
//! Re-architected per the design notes as an explicit value carrying four
//! ordered callback lists, rather than ambient context plus exception-based
//! unwinding. Pipeline steps register cleanup at the point of acquisition
//! (e.g. the transport registers its ack/abandon in [`Transport::receive`]
//! before returning the message) instead of relying on a surrounding
//! try/finally.
//!
//! ```text
//!         ┌── commit ──► Committed ─(fire on_committed then on_completed)─┐
//! Active ─┤                                                               ├─► Disposed
//!         └── abort  ──► Aborted ───(fire on_aborted)─────────────────────┘
//! ```
//!
//! `dispose` always fires `on_disposed`, exactly once, last. A second
//! terminal call after `commit`/`abort` is a no-op.

use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A registered callback: an owned closure producing a boxed future. Takes no
/// arguments — callbacks close over whatever `Arc`/`Arc<Mutex<_>>` state they
/// need, avoiding a self-referential borrow of the context they're attached to.
type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CallbackError>> + Send>;

/// Error returned by a transaction callback.
#[derive(thiserror::Error, Debug, Clone)]
#[error("transaction callback failed: {0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    /// Build a callback error from any displayable value.
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

/// The lifecycle state of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Neither committed nor aborted yet.
    Active,
    /// `commit()` has run; `on_committed` then `on_completed` have fired.
    Committed,
    /// `abort()` has run; `on_aborted` has fired.
    Aborted,
    /// `dispose()` has run; `on_disposed` has fired. Terminal.
    Disposed,
}

/// Per-message scratch space: a string-keyed item bag plus the four ordered
/// callback lists (`on_committed`, `on_aborted`, `on_completed`,
/// `on_disposed`).
///
/// Invariants (spec §3, §4.B):
/// - Exactly one of [`commit`](Self::commit) or [`abort`](Self::abort) is
///   invoked.
/// - [`dispose`](Self::dispose) runs exactly once and last.
/// - Callbacks within a list fire in registration order.
/// - A failure in any callback aborts the *remaining* callbacks of that list
///   but never skips dispose.
pub struct TransactionContext {
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    on_committed: Mutex<Vec<Callback>>,
    on_aborted: Mutex<Vec<Callback>>,
    on_completed: Mutex<Vec<Callback>>,
    on_disposed: Mutex<Vec<Callback>>,
    state: Mutex<TxState>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &*self.state.lock().unwrap_or_else(|e| e.into_inner()))
            .finish_non_exhaustive()
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    /// Create a fresh, active transaction context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            on_committed: Mutex::new(Vec::new()),
            on_aborted: Mutex::new(Vec::new()),
            on_completed: Mutex::new(Vec::new()),
            on_disposed: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Active),
        }
    }

    /// Fetch the item stored under `key`, or insert the value produced by
    /// `factory` if it isn't present yet. The same typed value is returned on
    /// every call with the same key for the lifetime of this context.
    ///
    /// # Panics
    ///
    /// Panics if an item is already stored under `key` with a different type
    /// than `T` — this indicates two components disagreeing about the shape
    /// of shared per-transaction state, which is a programming error.
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
            .unwrap_or_else(|_| panic!("transaction item {key:?} stored under a conflicting type"))
    }

    /// Register a callback to run after the transaction commits, in
    /// registration order, before `on_completed`.
    pub fn on_committed<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.push(&self.on_committed, f);
    }

    /// Register a callback to run after the transaction aborts.
    pub fn on_aborted<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.push(&self.on_aborted, f);
    }

    /// Register a post-ack successful-cleanup callback, run only after a
    /// successful commit, after `on_committed`.
    pub fn on_completed<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.push(&self.on_completed, f);
    }

    /// Register a terminal cleanup callback. Always runs, exactly once, last.
    pub fn on_disposed<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.push(&self.on_disposed, f);
    }

    fn push<F, Fut>(&self, list: &Mutex<Vec<Callback>>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        let boxed: Callback = Box::new(move || Box::pin(f()));
        list.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(boxed);
    }

    /// Commit the transaction: fires `on_committed` then `on_completed`, in
    /// registration order. No-op if the transaction already reached a
    /// terminal state.
    pub async fn commit(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state != TxState::Active {
                return;
            }
            *state = TxState::Committed;
        }
        run_list(&self.on_committed, "on_committed").await;
        run_list(&self.on_completed, "on_completed").await;
    }

    /// Abort the transaction: fires `on_aborted`, in registration order.
    /// No-op if the transaction already reached a terminal state.
    pub async fn abort(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state != TxState::Active {
                return;
            }
            *state = TxState::Aborted;
        }
        run_list(&self.on_aborted, "on_aborted").await;
    }

    /// Dispose the transaction: fires `on_disposed`, exactly once, last.
    /// Always runs regardless of whether `commit` or `abort` was called, or
    /// neither (an abandoned active transaction is treated as aborted first).
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state == TxState::Disposed {
                return;
            }
            if *state == TxState::Active {
                // An active transaction that is disposed without an explicit
                // commit/abort is treated as aborted, so onAborted still runs.
                *state = TxState::Aborted;
                drop(state);
                run_list(&self.on_aborted, "on_aborted").await;
            } else {
                drop(state);
            }
        }
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = TxState::Disposed;
        run_list(&self.on_disposed, "on_disposed").await;
    }

    /// Whether the transaction has reached a terminal (committed or aborted)
    /// state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(*self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner), TxState::Active)
    }
}

/// Run every callback in `list` serially, in registration order. A failing
/// callback is logged and stops the remainder of *this* list, but the caller
/// always proceeds to the next phase (commit never skips `on_completed`'s
/// list wholesale just because nothing ran, and dispose always follows).
async fn run_list(list: &Mutex<Vec<Callback>>, name: &'static str) {
    let callbacks = std::mem::take(&mut *list.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
    for callback in callbacks {
        if let Err(err) = callback().await {
            tracing::error!(list = name, error = %err, "transaction callback failed, skipping remainder of this list");
            break;
        }
    }
}
