//! Dead Letter Queue (DLQ) for deliveries that gave up.
//!
//! Consumers park deliveries here once the retry ceiling is reached or the
//! payload can never be processed. Operators list, resolve or discard them.
//!
//! ```sql
//! CREATE TABLE failed_events (
//!     id               BIGSERIAL PRIMARY KEY,
//!     queue            TEXT NOT NULL,
//!     topic            TEXT NOT NULL,
//!     routing_key      TEXT NOT NULL,
//!     event_id         UUID NOT NULL,
//!     event_type       TEXT NOT NULL,
//!     dedupe_key       TEXT NOT NULL,
//!     schema_version   INTEGER NOT NULL,
//!     occurred_at      TIMESTAMPTZ NOT NULL,
//!     causation_id     UUID,
//!     payload          BYTEA NOT NULL,
//!     error_message    TEXT NOT NULL,
//!     attempts         INTEGER NOT NULL,
//!     first_failed_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     last_failed_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     status           TEXT NOT NULL DEFAULT 'pending',
//!     resolved_at      TIMESTAMPTZ,
//!     resolved_by      TEXT,
//!     resolution_notes TEXT,
//!     UNIQUE (queue, event_id)
//! );
//! ```

use crate::envelope_from_row;
use boxoffice_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::BoxFuture;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Errors from DLQ operations.
#[derive(Error, Debug)]
pub enum DLQError {
    /// Query failed
    #[error("DLQ database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored status string is not known
    #[error("Invalid DLQ status: {0}")]
    InvalidStatus(String),

    /// No entry with that id
    #[error("DLQ entry {0} not found")]
    NotFound(i64),
}

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Being looked at or reprocessed
    Processing,
    /// Fixed and reprocessed
    Resolved,
    /// Given up on for good
    Discarded,
}

impl DLQStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::InvalidStatus`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, DLQError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            other => Err(DLQError::InvalidStatus(other.to_string())),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// Entry id
    pub id: i64,
    /// Consumer queue that gave up
    pub queue: String,
    /// Topic the delivery came from
    pub topic: String,
    /// Routing key of the delivery
    pub routing_key: String,
    /// The envelope that failed
    pub event: SerializedEvent,
    /// Last processing error
    pub error_message: String,
    /// Delivery attempts made before parking
    pub attempts: i32,
    /// When the delivery was first parked
    pub first_failed_at: DateTime<Utc>,
    /// When it was most recently parked
    pub last_failed_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use boxoffice_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} failed on {}: {}", entry.event.event_type, entry.queue, entry.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r"
    SELECT id, queue, topic, routing_key, event_id, event_type, dedupe_key,
           schema_version, occurred_at, causation_id, payload,
           error_message, attempts, first_failed_at, last_failed_at, status,
           resolved_at, resolved_by, resolution_notes
    FROM failed_events
";

impl DeadLetterQueue {
    /// Create a DLQ over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park a delivery. Parking the same event for the same queue again
    /// refreshes the existing entry and puts it back to pending.
    ///
    /// Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DLQError> {
        let event = &letter.event;
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                queue, topic, routing_key, event_id, event_type, dedupe_key,
                schema_version, occurred_at, causation_id, payload,
                error_message, attempts
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (queue, event_id) DO UPDATE
            SET error_message = EXCLUDED.error_message,
                attempts = failed_events.attempts + EXCLUDED.attempts,
                last_failed_at = NOW(),
                status = 'pending'
            RETURNING id
            ",
        )
        .bind(&letter.queue)
        .bind(&letter.topic)
        .bind(&letter.routing_key)
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.dedupe_key)
        .bind(i32::from(event.schema_version))
        .bind(event.occurred_at)
        .bind(event.causation_id)
        .bind(&event.data)
        .bind(&letter.error)
        .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            dlq_id = id,
            queue = %letter.queue,
            event_type = %event.event_type,
            dedupe_key = %event.dedupe_key,
            attempts = letter.attempts,
            error = %letter.error,
            "Event added to Dead Letter Queue"
        );
        metrics::counter!("dlq_entries_added_total", "queue" => letter.queue.clone()).increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, DLQError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// Entries with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, DLQError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY first_failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedEvent, DLQError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DLQError::NotFound(id))?;

        Self::row_to_failed_event(&row)
    }

    /// Move an entry to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DLQError> {
        let result = sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DLQError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved', resolved_at = NOW(), resolved_by = $1, resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dlq_entries_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DLQError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded', resolved_at = NOW(), resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dlq_entries_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DLQError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, DLQError> {
        let status: String = row.try_get("status")?;
        Ok(FailedEvent {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            topic: row.try_get("topic")?,
            routing_key: row.try_get("routing_key")?,
            event: envelope_from_row(row)?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            first_failed_at: row.try_get("first_failed_at")?,
            last_failed_at: row.try_get("last_failed_at")?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution_notes: row.try_get("resolution_notes")?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn park(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>> {
        Box::pin(async move {
            self.add_entry(&letter)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError::Storage(e.to_string()))
        })
    }
}
