//! Processed-events ledger.
//!
//! One row per `(consumer, dedupe_key)`. Inserting the row inside the same
//! transaction as the handler's state change makes redelivery a no-op: the
//! second insert finds the row and the handler skips its work.
//!
//! ```sql
//! CREATE TABLE processed_events (
//!     consumer     TEXT NOT NULL,
//!     dedupe_key   TEXT NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (consumer, dedupe_key)
//! );
//! ```

use sqlx::{PgConnection, PgExecutor};

/// Record `dedupe_key` as processed by `consumer`.
///
/// Returns `true` if this is the first time, `false` if it was already
/// recorded.
///
/// # Errors
///
/// Returns the underlying [`sqlx::Error`] if the insert fails.
pub async fn mark_processed(
    conn: &mut PgConnection,
    consumer: &str,
    dedupe_key: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO processed_events (consumer, dedupe_key)
        VALUES ($1, $2)
        ON CONFLICT (consumer, dedupe_key) DO NOTHING
        ",
    )
    .bind(consumer)
    .bind(dedupe_key)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Whether `consumer` has already recorded `dedupe_key`.
///
/// A plain read outside any transaction, for handlers that must not hold
/// one open while they call out.
///
/// # Errors
///
/// Returns the underlying [`sqlx::Error`] if the query fails.
pub async fn is_processed<'e>(
    executor: impl PgExecutor<'e>,
    consumer: &str,
    dedupe_key: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM processed_events WHERE consumer = $1 AND dedupe_key = $2)",
    )
    .bind(consumer)
    .bind(dedupe_key)
    .fetch_one(executor)
    .await
}
