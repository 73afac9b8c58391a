//! Dead letter queue for poison messages (§7, §8 seed scenario 6).
//!
//! A message exhausting its transport's max-deliveries policy needs
//! somewhere to land with `rbs2-error-details` attached (§7); this gives
//! that somewhere an operator-facing inspection API: list pending failures,
//! mark one resolved or permanently discarded, count the backlog for a
//! health check.
//!
//! ```sql
//! CREATE TABLE dead_lettered_messages (
//!     id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//!     source_queue TEXT NOT NULL,
//!     body BYTEA NOT NULL,
//!     headers_json JSONB NOT NULL,
//!     error_message TEXT NOT NULL,
//!     error_details TEXT,
//!     delivery_count INT NOT NULL,
//!     first_failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     last_failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     resolved_at TIMESTAMPTZ,
//!     resolved_by TEXT,
//!     resolution_notes TEXT
//! );
//! ```

use chrono::{DateTime, Utc};
use rustbus_core::headers::TransportMessage;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by [`DeadLetterQueue`] operations.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The underlying query failed or returned malformed data.
    #[error("dead letter queue error: {0}")]
    StoreError(String),
}

/// Status of an entry in the dead letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqStatus {
    /// Pending investigation or manual reprocessing.
    Pending,
    /// Currently being reprocessed.
    Processing,
    /// Reprocessed successfully.
    Resolved,
    /// Permanently discarded — cannot be fixed by replay.
    Discarded,
}

impl DlqStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse a status from its database representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if `s` doesn't match a known
    /// status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            other => Err(DeadLetterError::StoreError(format!(
                "invalid dead letter status: {other}"
            ))),
        }
    }
}

/// A poison message parked in the dead letter queue, plus the failure
/// metadata an operator needs to decide whether to replay or discard it.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Store-assigned identifier for this entry.
    pub id: i64,
    /// The queue the message was originally received from.
    pub source_queue: String,
    /// The original transport message: body plus headers, including
    /// whatever `rbs2-*` headers the failing delivery carried.
    pub message: TransportMessage,
    /// Human-readable cause of the final failure.
    pub error_message: String,
    /// Extended failure details (debug output, chained error causes), also
    /// what gets mirrored into the `rbs2-error-details` header (§7) when the
    /// entry is created.
    pub error_details: Option<String>,
    /// How many delivery attempts the transport made before giving up.
    pub delivery_count: i32,
    /// When this message first failed.
    pub first_failed_at: DateTime<Utc>,
    /// When this message most recently failed.
    pub last_failed_at: DateTime<Utc>,
    /// Current triage status.
    pub status: DlqStatus,
    /// When the entry was resolved or discarded, if it has been.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who or what resolved/discarded the entry.
    pub resolved_by: Option<String>,
    /// Free-text notes on the resolution.
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed dead letter queue.
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Wrap an existing connection pool. Callers are responsible for having
    /// applied the `dead_lettered_messages` table migration.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park a poison message. `message.headers` should already carry
    /// `rbs2-error-details` (§7); `error_details` here additionally persists
    /// the full cause for operator triage even if that header was truncated
    /// by header hygiene (§4.A).
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the insert fails.
    pub async fn add_entry(
        &self,
        source_queue: &str,
        message: &TransportMessage,
        error_message: &str,
        error_details: Option<&str>,
        delivery_count: i32,
    ) -> Result<i64, DeadLetterError> {
        let headers_json = serde_json::to_value(&message.headers)
            .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_lettered_messages (
                source_queue, body, headers_json, error_message, error_details, delivery_count
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(source_queue)
        .bind(&message.body)
        .bind(headers_json)
        .bind(error_message)
        .bind(error_details)
        .bind(delivery_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            source_queue,
            error = error_message,
            delivery_count,
            "message moved to dead letter queue"
        );
        metrics::counter!("rustbus.dead_letter.added", "source_queue" => source_queue.to_string())
            .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterError> {
        self.list_by_status(DlqStatus::Pending, limit).await
    }

    /// List entries in a given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DlqStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, DeadLetterError> {
        #[allow(clippy::cast_possible_wrap)]
        let rows = sqlx::query(
            r"
            SELECT id, source_queue, body, headers_json, error_message, error_details,
                   delivery_count, first_failed_at, last_failed_at, status,
                   resolved_at, resolved_by, resolution_notes
            FROM dead_lettered_messages
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Fetch a specific entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the query fails or no
    /// entry with that id exists.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT id, source_queue, body, headers_json, error_message, error_details,
                   delivery_count, first_failed_at, last_failed_at, status,
                   resolved_at, resolved_by, resolution_notes
            FROM dead_lettered_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        Self::row_to_failed_message(&row)
    }

    /// Mark an entry resolved, e.g. after a successful manual replay.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE dead_lettered_messages
            SET status = 'resolved', resolved_at = NOW(), resolved_by = $1, resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "dead letter entry resolved");
        metrics::counter!("rustbus.dead_letter.resolved").increment(1);
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE dead_lettered_messages
            SET status = 'discarded', resolved_at = NOW(), resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "dead letter entry discarded");
        metrics::counter!("rustbus.dead_letter.discarded").increment(1);
        Ok(())
    }

    /// Count pending entries — useful as a health-check gauge.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StoreError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_lettered_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;
        Ok(count)
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, DeadLetterError> {
        let headers_json: serde_json::Value = row.get("headers_json");
        let headers: HashMap<String, String> = serde_json::from_value(headers_json)
            .map_err(|e| DeadLetterError::StoreError(e.to_string()))?;

        let status_str: String = row.get("status");
        let status = DlqStatus::parse(&status_str)?;

        Ok(FailedMessage {
            id: row.get("id"),
            source_queue: row.get("source_queue"),
            message: TransportMessage::new(row.get("body"), headers),
            error_message: row.get("error_message"),
            error_details: row.get("error_details"),
            delivery_count: row.get("delivery_count"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_status_roundtrip() {
        for status in [
            DlqStatus::Pending,
            DlqStatus::Processing,
            DlqStatus::Resolved,
            DlqStatus::Discarded,
        ] {
            let parsed = DlqStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn dlq_status_rejects_unknown_value() {
        assert!(DlqStatus::parse("unknown").is_err());
    }
}
