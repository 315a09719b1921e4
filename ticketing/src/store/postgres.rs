//! `PostgreSQL` [`TicketStore`].
//!
//! Schema lives in `migrations/`. A unit of work is one sqlx transaction;
//! dropping it rolls back.
//!
//! Claims never read-then-update. The candidate rows are picked and locked
//! by the same statement that flips them:
//!
//! ```sql
//! UPDATE ticket_units SET status = 'reserved', booking_id = $4, buyer_id = $5
//! WHERE id IN (
//!     SELECT id FROM ticket_units
//!     WHERE event_id = $1 AND ticket_type = $2 AND status = 'available'
//!     ORDER BY id LIMIT $3
//!     FOR UPDATE SKIP LOCKED
//! )
//! RETURNING ...
//! ```
//!
//! Concurrent claimers skip each other's locked rows instead of queueing on
//! them, so a claim sees only what it could actually get.

use super::{BookingView, ClaimRequest, StoreError, TicketStore, UnitOfWork};
use crate::aggregates::booking::Booking;
use crate::types::{
    BookingId, BookingStatus, BuyerId, Event, EventId, Money, Page, PaymentId, TicketUnit, TicketUnitId,
    TypeAvailability, UnitStatus,
};
use async_trait::async_trait;
use boxoffice_core::event::SerializedEvent;
use boxoffice_postgres::{PostgresOutbox, outbox, processed};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const UNIT_COLUMNS: &str = "id, event_id, ticket_type, price_cents, status, booking_id, buyer_id";
const BOOKING_COLUMNS: &str =
    "id, buyer_id, event_id, status, total_price_cents, payment_id, version, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(db.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

fn corrupt(what: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {error}"))
}

fn cents_to_db(price: Money) -> Result<i64, StoreError> {
    i64::try_from(price.cents()).map_err(|e| corrupt("price", e))
}

fn cents_from_db(cents: i64) -> Result<Money, StoreError> {
    u64::try_from(cents).map(Money::from_cents).map_err(|e| corrupt("price", e))
}

fn unit_from_row(row: &PgRow) -> Result<TicketUnit, StoreError> {
    let status: String = row.try_get("status")?;
    let unit = TicketUnit::restore(
        TicketUnitId::from_uuid(row.try_get("id")?),
        EventId::from_uuid(row.try_get("event_id")?),
        row.try_get("ticket_type")?,
        cents_from_db(row.try_get("price_cents")?)?,
        status.parse().map_err(|e| corrupt("unit status", e))?,
        row.try_get::<Option<Uuid>, _>("booking_id")?.map(BookingId::from_uuid),
        row.try_get::<Option<Uuid>, _>("buyer_id")?.map(BuyerId::from_uuid),
    );
    if !unit.is_consistent() {
        return Err(corrupt("unit owner", format!("{} is {} with owner {:?}", unit.id, unit.status(), unit.booking_id())));
    }
    Ok(unit)
}

fn booking_from_row(row: &PgRow) -> Result<Booking, StoreError> {
    let status: String = row.try_get("status")?;
    let version: i32 = row.try_get("version")?;
    Ok(Booking::restore(
        BookingId::from_uuid(row.try_get("id")?),
        BuyerId::from_uuid(row.try_get("buyer_id")?),
        EventId::from_uuid(row.try_get("event_id")?),
        status.parse().map_err(|e| corrupt("booking status", e))?,
        cents_from_db(row.try_get("total_price_cents")?)?,
        row.try_get::<Option<Uuid>, _>("payment_id")?.map(PaymentId::from_uuid),
        u32::try_from(version).map_err(|e| corrupt("booking version", e))?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
    ))
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Event {
        id: EventId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        venue: row.try_get("venue")?,
        starts_at: row.try_get("starts_at")?,
        status: status.parse().map_err(|e| corrupt("event status", e))?,
        created_at: row.try_get("created_at")?,
    })
}

/// Store over a Postgres pool.
#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` with at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the pool cannot connect.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Self::connect_with_timeout(url, max_connections, Duration::from_secs(30)).await
    }

    /// Like [`PgTicketStore::connect`], giving up on each connection
    /// attempt after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the pool cannot connect in time.
    pub async fn connect_with_timeout(url: &str, max_connections: u32, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// The outbox reader for the relay.
    #[must_use]
    pub fn outbox(&self) -> PostgresOutbox {
        PostgresOutbox::new(self.pool.clone())
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<BookingView>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let units = sqlx::query(&format!("SELECT {UNIT_COLUMNS} FROM ticket_units WHERE booking_id = $1 ORDER BY id"))
            .bind(booking_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(unit_from_row)
            .collect::<Result<_, _>>()?;

        Ok(Some(BookingView { booking: booking_from_row(&row)?, units }))
    }

    async fn bookings_for_buyer(&self, buyer_id: BuyerId, page: Page) -> Result<Vec<Booking>, StoreError> {
        sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE buyer_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(buyer_id.as_uuid())
        .bind(i64::from(page.size()))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(booking_from_row)
        .collect()
    }

    async fn availability(&self, event_id: EventId) -> Result<Vec<TypeAvailability>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT ticket_type, price_cents,
                   COUNT(*) FILTER (WHERE status = 'available') AS available
            FROM ticket_units
            WHERE event_id = $1
            GROUP BY ticket_type, price_cents
            ORDER BY ticket_type, price_cents
            ",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TypeAvailability, StoreError> {
                let available: i64 = row.try_get("available")?;
                Ok(TypeAvailability {
                    ticket_type: row.try_get("ticket_type")?,
                    price: cents_from_db(row.try_get("price_cents")?)?,
                    available: u32::try_from(available).map_err(|e| corrupt("available count", e))?,
                })
            })
            .collect()
    }

    async fn is_processed(&self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError> {
        Ok(processed::is_processed(&self.pool, consumer, dedupe_key).await?)
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn claim(&mut self, request: &ClaimRequest<'_>) -> Result<Vec<TicketUnit>, StoreError> {
        if request.quantity == 0 {
            return Err(StoreError::InvalidQuantity);
        }

        let rows = sqlx::query(&format!(
            r"
            UPDATE ticket_units
            SET status = 'reserved', booking_id = $4, buyer_id = $5
            WHERE id IN (
                SELECT id FROM ticket_units
                WHERE event_id = $1 AND ticket_type = $2 AND status = 'available'
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {UNIT_COLUMNS}
            "
        ))
        .bind(request.event_id.as_uuid())
        .bind(request.ticket_type)
        .bind(i64::from(request.quantity))
        .bind(request.booking_id.as_uuid())
        .bind(request.buyer_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        if rows.len() < request.quantity as usize {
            return Err(StoreError::InsufficientInventory {
                ticket_type: request.ticket_type.to_string(),
                requested: request.quantity,
                available: u32::try_from(rows.len()).unwrap_or(u32::MAX),
            });
        }

        rows.iter().map(unit_from_row).collect()
    }

    async fn release(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        sqlx::query(&format!(
            "UPDATE ticket_units SET status = 'available', booking_id = NULL, buyer_id = NULL \
             WHERE booking_id = $1 RETURNING {UNIT_COLUMNS}"
        ))
        .bind(booking_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(unit_from_row)
        .collect()
    }

    async fn confirm(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        let owned: Vec<TicketUnit> = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM ticket_units WHERE booking_id = $1 ORDER BY id FOR UPDATE"
        ))
        .bind(booking_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(unit_from_row)
        .collect::<Result<_, _>>()?;

        if let Some(unit) = owned.iter().find(|unit| unit.status() != UnitStatus::Reserved) {
            return Err(StoreError::InvalidUnitState { unit_id: unit.id, status: unit.status() });
        }

        sqlx::query(&format!(
            "UPDATE ticket_units SET status = 'sold' WHERE booking_id = $1 RETURNING {UNIT_COLUMNS}"
        ))
        .bind(booking_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(unit_from_row)
        .collect()
    }

    async fn units_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        sqlx::query(&format!("SELECT {UNIT_COLUMNS} FROM ticket_units WHERE booking_id = $1 ORDER BY id"))
            .bind(booking_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await?
            .iter()
            .map(unit_from_row)
            .collect()
    }

    async fn insert_event(&mut self, event: &Event, units: &[TicketUnit]) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO events (id, name, venue, starts_at, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(&event.venue)
        .bind(event.starts_at)
        .bind(event.status.as_str())
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await?;

        let ids: Vec<Uuid> = units.iter().map(|unit| *unit.id.as_uuid()).collect();
        let types: Vec<String> = units.iter().map(|unit| unit.ticket_type.clone()).collect();
        let prices = units
            .iter()
            .map(|unit| cents_to_db(unit.price))
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query(
            r"
            INSERT INTO ticket_units (id, event_id, ticket_type, price_cents, status)
            SELECT u.id, $2, u.ticket_type, u.price_cents, 'available'
            FROM UNNEST($1::uuid[], $3::text[], $4::bigint[]) AS u(id, ticket_type, price_cents)
            ",
        )
        .bind(ids)
        .bind(event.id.as_uuid())
        .bind(types)
        .bind(prices)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn load_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        sqlx::query("SELECT id, name, venue, starts_at, status, created_at FROM events WHERE id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(event_from_row)
            .transpose()
    }

    async fn insert_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        sqlx::query(&format!("INSERT INTO bookings ({BOOKING_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"))
            .bind(booking.id().as_uuid())
            .bind(booking.buyer_id().as_uuid())
            .bind(booking.event_id().as_uuid())
            .bind(booking.status().as_str())
            .bind(cents_to_db(booking.total_price())?)
            .bind(booking.payment_id().map(|id| *id.as_uuid()))
            .bind(i32::try_from(booking.version()).map_err(|e| corrupt("booking version", e))?)
            .bind(booking.created_at())
            .bind(booking.updated_at())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_booking(&mut self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"))
            .bind(booking_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(booking_from_row)
            .transpose()
    }

    async fn lock_bookings_for_buyer(
        &mut self,
        buyer_id: BuyerId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, StoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE buyer_id = $1 AND status = ANY($2) \
             ORDER BY created_at, id FOR UPDATE"
        ))
        .bind(buyer_id.as_uuid())
        .bind(statuses)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(booking_from_row)
        .collect()
    }

    async fn save_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE bookings
            SET status = $2, payment_id = $3, version = $4, updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(booking.id().as_uuid())
        .bind(booking.status().as_str())
        .bind(booking.payment_id().map(|id| *id.as_uuid()))
        .bind(i32::try_from(booking.version()).map_err(|e| corrupt("booking version", e))?)
        .bind(booking.updated_at())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("booking {} vanished", booking.id())));
        }
        Ok(())
    }

    async fn enqueue(&mut self, topic: &str, routing_key: &str, event: &SerializedEvent) -> Result<(), StoreError> {
        outbox::enqueue(&mut *self.tx, topic, routing_key, event).await?;
        Ok(())
    }

    async fn mark_processed(&mut self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError> {
        Ok(processed::mark_processed(&mut *self.tx, consumer, dedupe_key).await?)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
