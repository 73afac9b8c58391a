//! A relational reference [`SagaStorage`] (§4.K, §6): one row per saga plus
//! an indexed correlation table, the shape spec.md names for the relational
//! backend. Optimistic concurrency is the same `WHERE revision = @expected`
//! the spec names, expressed as a conditional `UPDATE`/`DELETE`; the
//! correlation-collision invariant ("Insert of a `(correlationProperty,
//! value)` collides with an existing saga of the same type" must fail) is
//! enforced by `saga_correlations`' composite primary key.
//!
//! ```sql
//! CREATE TABLE sagas (
//!     id TEXT PRIMARY KEY,
//!     data_type TEXT NOT NULL,
//!     revision BIGINT NOT NULL,
//!     payload JSONB NOT NULL
//! );
//! CREATE INDEX sagas_data_type_idx ON sagas (data_type);
//!
//! CREATE TABLE saga_correlations (
//!     data_type TEXT NOT NULL,
//!     property_path TEXT NOT NULL,
//!     value JSONB NOT NULL,
//!     saga_id TEXT NOT NULL REFERENCES sagas (id) ON DELETE CASCADE,
//!     PRIMARY KEY (data_type, property_path, value)
//! );
//! ```

use futures::future::BoxFuture;
use rustbus_core::saga::{CorrelationValue, SagaData, SagaError, SagaStorage};
use serde_json::Value;
use sqlx::{PgPool, Row};

/// `PostgreSQL`-backed [`SagaStorage`].
pub struct PostgresSagaStorage {
    pool: PgPool,
}

impl PostgresSagaStorage {
    /// Wrap an existing connection pool. Callers are responsible for having
    /// applied the `sagas`/`saga_correlations` table migrations.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Normalize a correlation property path so `"/order_id"` and bare
/// `"order_id"` index to the same `saga_correlations` row.
fn normalize_path(property_path: &str) -> String {
    property_path.trim_start_matches('/').to_string()
}

impl SagaStorage for PostgresSagaStorage {
    fn find<'a>(
        &'a self,
        data_type: &'a str,
        property_path: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, Result<Option<SagaData>, SagaError>> {
        Box::pin(async move {
            let path = normalize_path(property_path);
            let row = sqlx::query(
                r"
                SELECT s.id, s.data_type, s.revision, s.payload
                FROM saga_correlations c
                JOIN sagas s ON s.id = c.saga_id
                WHERE c.data_type = $1 AND c.property_path = $2 AND c.value = $3
                LIMIT 1
                ",
            )
            .bind(data_type)
            .bind(&path)
            .bind(sqlx::types::Json(value))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SagaError::StoreError(e.to_string()))?;

            Ok(row.map(|row| SagaData {
                id: row.get("id"),
                data_type: row.get("data_type"),
                revision: u64::try_from(row.get::<i64, _>("revision")).unwrap_or(0),
                payload: row.get::<sqlx::types::Json<Value>, _>("payload").0,
            }))
        })
    }

    fn insert<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| SagaError::StoreError(e.to_string()))?;

            #[allow(clippy::cast_possible_wrap)]
            let revision = data.revision as i64;
            let result = sqlx::query(
                r"
                INSERT INTO sagas (id, data_type, revision, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(&data.id)
            .bind(&data.data_type)
            .bind(revision)
            .bind(sqlx::types::Json(&data.payload))
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::StoreError(e.to_string()))?;

            if result.rows_affected() == 0 {
                tracing::warn!(saga_id = %data.id, "saga insert conflicted on existing id");
                metrics::counter!("rustbus.saga.occ_conflict", "op" => "insert").increment(1);
                return Err(SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: data.revision,
                });
            }

            for correlation in correlations {
                let inserted = sqlx::query(
                    r"
                    INSERT INTO saga_correlations (data_type, property_path, value, saga_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (data_type, property_path, value) DO NOTHING
                    ",
                )
                .bind(&data.data_type)
                .bind(normalize_path(&correlation.property_path))
                .bind(sqlx::types::Json(&correlation.value))
                .bind(&data.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SagaError::StoreError(e.to_string()))?;

                if inserted.rows_affected() == 0 {
                    tracing::warn!(
                        saga_id = %data.id,
                        property_path = %correlation.property_path,
                        "saga insert conflicted on correlation value"
                    );
                    metrics::counter!("rustbus.saga.occ_conflict", "op" => "insert_correlation").increment(1);
                    return Err(SagaError::ConcurrencyConflict {
                        id: data.id.clone(),
                        expected_revision: data.revision,
                    });
                }
            }

            tx.commit().await.map_err(|e| SagaError::StoreError(e.to_string()))?;
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| SagaError::StoreError(e.to_string()))?;

            #[allow(clippy::cast_possible_wrap)]
            let revision = data.revision as i64;
            let result = sqlx::query(
                r"
                UPDATE sagas
                SET revision = revision + 1, payload = $1
                WHERE id = $2 AND revision = $3
                ",
            )
            .bind(sqlx::types::Json(&data.payload))
            .bind(&data.id)
            .bind(revision)
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::StoreError(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(self.revision_conflict_or_missing(data).await);
            }

            sqlx::query("DELETE FROM saga_correlations WHERE saga_id = $1")
                .bind(&data.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SagaError::StoreError(e.to_string()))?;

            for correlation in correlations {
                let inserted = sqlx::query(
                    r"
                    INSERT INTO saga_correlations (data_type, property_path, value, saga_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (data_type, property_path, value) DO NOTHING
                    ",
                )
                .bind(&data.data_type)
                .bind(normalize_path(&correlation.property_path))
                .bind(sqlx::types::Json(&correlation.value))
                .bind(&data.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SagaError::StoreError(e.to_string()))?;

                if inserted.rows_affected() == 0 {
                    metrics::counter!("rustbus.saga.occ_conflict", "op" => "update_correlation").increment(1);
                    return Err(SagaError::ConcurrencyConflict {
                        id: data.id.clone(),
                        expected_revision: data.revision,
                    });
                }
            }

            tx.commit().await.map_err(|e| SagaError::StoreError(e.to_string()))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, data: &'a SagaData) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let revision = data.revision as i64;
            let result = sqlx::query("DELETE FROM sagas WHERE id = $1 AND revision = $2")
                .bind(&data.id)
                .bind(revision)
                .execute(&self.pool)
                .await
                .map_err(|e| SagaError::StoreError(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(self.revision_conflict_or_missing(data).await);
            }
            Ok(())
        })
    }
}

impl PostgresSagaStorage {
    /// A conditional `UPDATE`/`DELETE` affecting zero rows means either the
    /// row doesn't exist at all, or it exists at a different revision; tell
    /// those apart with a follow-up read so the caller gets an accurate
    /// [`SagaError`].
    async fn revision_conflict_or_missing(&self, data: &SagaData) -> SagaError {
        let stored: Option<(i64,)> = sqlx::query_as("SELECT revision FROM sagas WHERE id = $1")
            .bind(&data.id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

        match stored {
            Some((revision,)) => {
                metrics::counter!("rustbus.saga.occ_conflict", "op" => "update").increment(1);
                SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: u64::try_from(revision).unwrap_or(0),
                }
            }
            None => SagaError::StoreError(format!("no saga with id {}", data.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_path;

    #[test]
    fn leading_slash_path_normalizes_to_bare_name() {
        assert_eq!(normalize_path("/order_id"), "order_id");
    }

    #[test]
    fn bare_field_name_is_unchanged() {
        assert_eq!(normalize_path("order_id"), "order_id");
    }

    #[test]
    fn nested_path_keeps_internal_slashes() {
        assert_eq!(normalize_path("/order/id"), "order/id");
    }
}
