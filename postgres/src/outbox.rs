//! Transactional outbox on the `outbox` table.
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id             BIGSERIAL PRIMARY KEY,
//!     topic          TEXT NOT NULL,
//!     routing_key    TEXT NOT NULL,
//!     event_id       UUID NOT NULL,
//!     event_type     TEXT NOT NULL,
//!     dedupe_key     TEXT NOT NULL,
//!     schema_version INTEGER NOT NULL,
//!     occurred_at    TIMESTAMPTZ NOT NULL,
//!     causation_id   UUID,
//!     payload        BYTEA NOT NULL,
//!     created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     published_at   TIMESTAMPTZ
//! );
//! ```

use crate::envelope_from_row;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::BoxFuture;
use boxoffice_core::outbox::{Outbox, OutboxError, OutboxMessage};
use sqlx::{PgConnection, PgPool, Row};

/// Append an event to the outbox inside the caller's transaction.
///
/// Returns the outbox id.
///
/// # Errors
///
/// Returns the underlying [`sqlx::Error`] if the insert fails.
pub async fn enqueue(
    conn: &mut PgConnection,
    topic: &str,
    routing_key: &str,
    event: &SerializedEvent,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox (
            topic, routing_key, event_id, event_type, dedupe_key,
            schema_version, occurred_at, causation_id, payload
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        ",
    )
    .bind(topic)
    .bind(routing_key)
    .bind(event.event_id)
    .bind(&event.event_type)
    .bind(&event.dedupe_key)
    .bind(i32::from(event.schema_version))
    .bind(event.occurred_at)
    .bind(event.causation_id)
    .bind(&event.data)
    .fetch_one(conn)
    .await?;

    tracing::trace!(outbox_id = id, event_type = %event.event_type, "Event enqueued");
    Ok(id)
}

/// Relay-side view of the outbox.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox reader over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, sqlx::Error> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT id, topic, routing_key, event_id, event_type, dedupe_key,
                   schema_version, occurred_at, causation_id, payload
            FROM outbox
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OutboxMessage {
                    id: row.try_get("id")?,
                    topic: row.try_get("topic")?,
                    routing_key: row.try_get("routing_key")?,
                    event: envelope_from_row(row)?,
                })
            })
            .collect()
    }
}

impl Outbox for PostgresOutbox {
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            self.fetch_pending(limit)
                .await
                .map_err(|e| OutboxError::Storage(e.to_string()))
        })
    }

    fn mark_published(&self, ids: &[i64]) -> BoxFuture<'_, Result<(), OutboxError>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            sqlx::query("UPDATE outbox SET published_at = NOW() WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&self.pool)
                .await
                .map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(())
        })
    }
}
