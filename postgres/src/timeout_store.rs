//! A relational reference [`TimeoutManager`] (§4.J, §6): the schema named
//! verbatim in the spec, `(id, due_utc, headers_json, body_blob,
//! leased_until_utc NULL)`, with `SELECT ... FOR UPDATE SKIP LOCKED` giving
//! the same snapshot-with-lease semantics `rustbus_testing::timeout_store`
//! gives in memory — a row is invisible to other pollers once leased, and
//! reappears once the lease lapses or is explicitly cleared.
//!
//! ```sql
//! CREATE TABLE deferred_messages (
//!     id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//!     due_utc TIMESTAMPTZ NOT NULL,
//!     headers_json JSONB NOT NULL,
//!     body_blob BYTEA NOT NULL,
//!     leased_until_utc TIMESTAMPTZ
//! );
//! CREATE INDEX deferred_messages_due_idx ON deferred_messages (due_utc)
//!     WHERE leased_until_utc IS NULL;
//! ```

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use rustbus_core::timeout::{DueMessage, DueMessageBatch, TimeoutManager, TimeoutStoreError};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};

/// How long a leased batch stays invisible to other pollers before the lease
/// is considered stale and the row becomes due again, in case a poller
/// crashes mid-batch without releasing it.
const LEASE_DURATION: Duration = Duration::seconds(30);

/// Maximum rows leased per [`TimeoutManager::get_due_messages`] call.
const BATCH_LIMIT: i64 = 100;

/// `PostgreSQL`-backed [`TimeoutManager`].
pub struct PostgresTimeoutManager {
    pool: PgPool,
}

impl PostgresTimeoutManager {
    /// Wrap an existing connection pool. Callers are responsible for having
    /// applied the `deferred_messages` table migration.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl TimeoutManager for PostgresTimeoutManager {
    fn defer<'a>(
        &'a self,
        due_at: DateTime<Utc>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
        Box::pin(async move {
            let headers_json = serde_json::to_value(&headers)
                .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO deferred_messages (due_utc, headers_json, body_blob)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(due_at)
            .bind(headers_json)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;

            Ok(())
        })
    }

    fn get_due_messages(&self) -> BoxFuture<'_, Result<Box<dyn DueMessageBatch>, TimeoutStoreError>> {
        Box::pin(async move {
            let now = Utc::now();
            let leased_until = now + LEASE_DURATION;

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;

            let rows = sqlx::query(
                r"
                SELECT id, due_utc, headers_json, body_blob
                FROM deferred_messages
                WHERE due_utc <= $1
                  AND (leased_until_utc IS NULL OR leased_until_utc < $1)
                ORDER BY due_utc ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .bind(BATCH_LIMIT)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;

            let ids: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();
            if !ids.is_empty() {
                sqlx::query("UPDATE deferred_messages SET leased_until_utc = $1 WHERE id = ANY($2)")
                    .bind(leased_until)
                    .bind(&ids)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;
            }

            tx.commit()
                .await
                .map_err(|e| TimeoutStoreError::StoreError(e.to_string()))?;

            let mut messages = Vec::with_capacity(rows.len());
            for row in &rows {
                let id: i64 = row.get("id");
                let headers_json: serde_json::Value = row.get("headers_json");
                let headers: HashMap<String, String> =
                    serde_json::from_value(headers_json).unwrap_or_default();
                messages.push(DueMessage {
                    id: id.to_string(),
                    due_at: row.get("due_utc"),
                    headers,
                    body: row.get("body_blob"),
                });
            }

            Ok(Box::new(PostgresDueMessageBatch {
                pool: self.pool.clone(),
                leased_ids: ids,
                messages,
                completed: HashSet::new(),
            }) as Box<dyn DueMessageBatch>)
        })
    }
}

/// The leased batch returned by [`PostgresTimeoutManager::get_due_messages`].
///
/// Rows not marked completed before the batch is dropped have their lease
/// cleared so the next poll sees them again; completed rows are deleted.
/// Both happen on a background task spawned from `Drop` since Rust has no
/// async `Drop` — the same reason `rustbus_runtime::worker` spawns a
/// best-effort cleanup task for shutdown-time abandon rather than awaiting
/// it inline.
struct PostgresDueMessageBatch {
    pool: PgPool,
    leased_ids: Vec<i64>,
    messages: Vec<DueMessage>,
    completed: HashSet<String>,
}

impl DueMessageBatch for PostgresDueMessageBatch {
    fn messages(&self) -> &[DueMessage] {
        &self.messages
    }

    fn mark_completed<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
        Box::pin(async move {
            self.completed.insert(id.to_string());
            Ok(())
        })
    }
}

impl Drop for PostgresDueMessageBatch {
    fn drop(&mut self) {
        if self.leased_ids.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        let completed: Vec<i64> = self
            .completed
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        let released: Vec<i64> = self
            .leased_ids
            .iter()
            .filter(|id| !completed.contains(id))
            .copied()
            .collect();

        tokio::spawn(async move {
            if !completed.is_empty() {
                if let Err(error) = sqlx::query("DELETE FROM deferred_messages WHERE id = ANY($1)")
                    .bind(&completed)
                    .execute(&pool)
                    .await
                {
                    tracing::warn!(%error, "failed to delete completed deferred messages");
                }
            }
            if !released.is_empty() {
                if let Err(error) = sqlx::query(
                    "UPDATE deferred_messages SET leased_until_utc = NULL WHERE id = ANY($1)",
                )
                .bind(&released)
                .execute(&pool)
                .await
                {
                    tracing::warn!(%error, "failed to release deferred message lease");
                }
            }
        });
    }
}
