//! `PostgreSQL` building blocks shared by the Box Office services.
//!
//! - [`PostgresOutbox`] and [`outbox::enqueue`]: the transactional outbox
//! - [`DeadLetterQueue`]: the `failed_events` table, also a
//!   [`DeadLetterSink`](boxoffice_core::dead_letter::DeadLetterSink)
//! - [`processed::mark_processed`]: the per-consumer idempotency ledger
//!
//! Writers take a `&mut PgConnection` so callers can run them inside their
//! own transaction. Queries use the runtime-checked `sqlx::query` API.
//!
//! # Example
//!
//! ```ignore
//! use boxoffice_postgres::{outbox, processed};
//!
//! let mut tx = pool.begin().await?;
//! if processed::mark_processed(&mut *tx, "booking-payments", &event.dedupe_key).await? {
//!     // ... apply the state change ...
//!     outbox::enqueue(&mut *tx, "ticket_events", "booking.updated", &follow_up).await?;
//! }
//! tx.commit().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use boxoffice_core::event::SerializedEvent;
use sqlx::Row;
use sqlx::postgres::PgRow;

pub mod dead_letter_queue;
pub mod outbox;
pub mod processed;

pub use dead_letter_queue::{DLQError, DLQStatus, DeadLetterQueue, FailedEvent};
pub use outbox::PostgresOutbox;

/// Rebuild an envelope from the envelope columns shared by `outbox` and
/// `failed_events`.
pub(crate) fn envelope_from_row(row: &PgRow) -> Result<SerializedEvent, sqlx::Error> {
    let schema_version: i32 = row.try_get("schema_version")?;
    Ok(SerializedEvent {
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        dedupe_key: row.try_get("dedupe_key")?,
        schema_version: u16::try_from(schema_version).map_err(|e| sqlx::Error::ColumnDecode {
            index: "schema_version".to_string(),
            source: Box::new(e),
        })?,
        occurred_at: row.try_get("occurred_at")?,
        causation_id: row.try_get("causation_id")?,
        data: row.try_get("payload")?,
    })
}
