//! An in-memory reference [`TimeoutManager`] (§4.J): a `HashMap` of deferred
//! rows plus a lease bit per row, following the same snapshot-with-lease
//! contract a relational store's `SELECT ... FOR UPDATE SKIP LOCKED` would
//! give a poller.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rustbus_core::environment::Clock;
use rustbus_core::timeout::{DueMessage, DueMessageBatch, TimeoutManager, TimeoutStoreError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Entry {
    due_at: DateTime<Utc>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    leased: bool,
}

/// In-memory [`TimeoutManager`]. Takes a [`Clock`] so tests can control which
/// rows are "due" without sleeping.
pub struct InMemoryTimeoutManager {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_id: AtomicU64,
}

impl InMemoryTimeoutManager {
    /// Create an empty store driven by `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of rows currently stored, due or not, leased or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimeoutManager for InMemoryTimeoutManager {
    fn defer<'a>(
        &'a self,
        due_at: DateTime<Utc>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(format!("timeout-{id}"), Entry { due_at, headers, body, leased: false });
            Ok(())
        })
    }

    fn get_due_messages(&self) -> BoxFuture<'_, Result<Box<dyn DueMessageBatch>, TimeoutStoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut messages = Vec::new();
            for (id, entry) in entries.iter_mut() {
                if !entry.leased && entry.due_at <= now {
                    entry.leased = true;
                    messages.push(DueMessage {
                        id: id.clone(),
                        due_at: entry.due_at,
                        headers: entry.headers.clone(),
                        body: entry.body.clone(),
                    });
                }
            }
            Ok(Box::new(InMemoryDueMessageBatch {
                entries: Arc::clone(&self.entries),
                messages,
                completed: Mutex::new(HashSet::new()),
            }) as Box<dyn DueMessageBatch>)
        })
    }
}

/// The leased batch returned by [`InMemoryTimeoutManager::get_due_messages`].
///
/// Dropping it without calling [`DueMessageBatch::mark_completed`] on a row
/// releases that row's lease, making it visible to the next poll — the same
/// RAII idiom as `rustbus_runtime::bottleneck::BottleneckToken`.
struct InMemoryDueMessageBatch {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    messages: Vec<DueMessage>,
    completed: Mutex<HashSet<String>>,
}

impl DueMessageBatch for InMemoryDueMessageBatch {
    fn messages(&self) -> &[DueMessage] {
        &self.messages
    }

    fn mark_completed<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
        Box::pin(async move {
            self.completed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(id.to_string());
            Ok(())
        })
    }
}

impl Drop for InMemoryDueMessageBatch {
    fn drop(&mut self) {
        let completed = self.completed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for message in &self.messages {
            if completed.contains(&message.id) {
                entries.remove(&message.id);
            } else if let Some(entry) = entries.get_mut(&message.id) {
                entry.leased = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FixedClock;
    use chrono::Duration;

    fn clock_at(t: DateTime<Utc>) -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(t))
    }

    #[tokio::test]
    async fn due_message_is_leased_and_hidden_until_batch_drops() {
        let now = Utc::now();
        let store = InMemoryTimeoutManager::new(clock_at(now));
        store.defer(now - Duration::seconds(1), HashMap::new(), b"x".to_vec()).await.unwrap();

        {
            let batch = store.get_due_messages().await.unwrap();
            assert_eq!(batch.messages().len(), 1);
            let second = store.get_due_messages().await.unwrap();
            assert!(second.messages().is_empty());
        }

        let batch = store.get_due_messages().await.unwrap();
        assert_eq!(batch.messages().len(), 1, "lease releases when batch drops uncompleted");
    }

    #[tokio::test]
    async fn marking_completed_deletes_the_row_on_drop() {
        let now = Utc::now();
        let store = InMemoryTimeoutManager::new(clock_at(now));
        store.defer(now - Duration::seconds(1), HashMap::new(), b"x".to_vec()).await.unwrap();

        {
            let mut batch = store.get_due_messages().await.unwrap();
            let id = batch.messages()[0].id.clone();
            batch.mark_completed(&id).await.unwrap();
        }

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn not_yet_due_messages_are_not_returned() {
        let now = Utc::now();
        let store = InMemoryTimeoutManager::new(clock_at(now));
        store.defer(now + Duration::hours(1), HashMap::new(), b"x".to_vec()).await.unwrap();

        let batch = store.get_due_messages().await.unwrap();
        assert!(batch.messages().is_empty());
    }
}
