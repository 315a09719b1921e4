//! Persistence seam for inventory, bookings, the outbox and the
//! processed-events ledger.
//!
//! Every write goes through a [`UnitOfWork`]: one local transaction that
//! commits on [`UnitOfWork::commit`] and rolls back when dropped. Unit
//! status changes only through [`claim`](UnitOfWork::claim),
//! [`release`](UnitOfWork::release) and [`confirm`](UnitOfWork::confirm).
//!
//! Two implementations:
//!
//! - [`PgTicketStore`]: `PostgreSQL` via sqlx, claims with
//!   `FOR UPDATE SKIP LOCKED`
//! - [`InMemoryTicketStore`]: serializes units of work behind one async
//!   lock, for tests and local runs

use crate::aggregates::booking::Booking;
use crate::types::{
    BookingId, BookingStatus, BuyerId, Event, EventId, Page, TicketUnit, TicketUnitId, TypeAvailability, UnitStatus,
};
use async_trait::async_trait;
use boxoffice_core::event::SerializedEvent;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTicketStore;
pub use postgres::PgTicketStore;

/// Store error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Fewer available units than requested
    #[error("Insufficient inventory for {ticket_type}: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Type label
        ticket_type: String,
        /// Units requested
        requested: u32,
        /// Units that were claimable
        available: u32,
    },

    /// Claim of zero units
    #[error("Quantity must be greater than zero")]
    InvalidQuantity,

    /// Confirm found a unit that is not reserved
    #[error("Ticket unit {unit_id} is {status}, expected reserved")]
    InvalidUnitState {
        /// Offending unit
        unit_id: TicketUnitId,
        /// Its status
        status: UnitStatus,
    },

    /// Insert collided with an existing row
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Database failure
    #[error("Database error: {0}")]
    Database(String),
}

/// Parameters of one claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRequest<'a> {
    /// Event to claim from
    pub event_id: EventId,
    /// Type label
    pub ticket_type: &'a str,
    /// Units wanted, must be positive
    pub quantity: u32,
    /// Booking that will own the units
    pub booking_id: BookingId,
    /// Buyer that will own the units
    pub buyer_id: BuyerId,
}

/// A booking with the units it currently owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingView {
    /// The booking
    pub booking: Booking,
    /// Units assigned to it, empty once cancelled or refunded
    pub units: Vec<TicketUnit>,
}

/// Entry point of the store.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no transaction can be started.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// A booking and its current units.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<BookingView>, StoreError>;

    /// A buyer's bookings, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn bookings_for_buyer(&self, buyer_id: BuyerId, page: Page) -> Result<Vec<Booking>, StoreError>;

    /// Available units of an event grouped by type and price.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn availability(&self, event_id: EventId) -> Result<Vec<TypeAvailability>, StoreError>;

    /// Whether `consumer` already recorded `dedupe_key`, read outside any
    /// unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn is_processed(&self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError>;
}

/// One local transaction.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Atomically reserve `quantity` available units of one type.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidQuantity`] for a zero quantity
    /// - [`StoreError::InsufficientInventory`] if fewer units are claimable;
    ///   the unit of work must then be dropped
    async fn claim(&mut self, request: &ClaimRequest<'_>) -> Result<Vec<TicketUnit>, StoreError>;

    /// Return every unit owned by the booking to the available pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    async fn release(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError>;

    /// Flip the booking's reserved units to sold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidUnitState`] without changing anything if
    /// any owned unit is not reserved.
    async fn confirm(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError>;

    /// Units currently owned by the booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn units_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError>;

    /// Insert an event and its units.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the event already exists.
    async fn insert_event(&mut self, event: &Event, units: &[TicketUnit]) -> Result<(), StoreError>;

    /// Read an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn load_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError>;

    /// Insert a new booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the id is taken.
    async fn insert_booking(&mut self, booking: &Booking) -> Result<(), StoreError>;

    /// Read a booking and hold it until the unit of work ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn lock_booking(&mut self, booking_id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Read and hold a buyer's bookings that are in one of `statuses`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn lock_bookings_for_buyer(
        &mut self,
        buyer_id: BuyerId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, StoreError>;

    /// Persist a booking after a transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    async fn save_booking(&mut self, booking: &Booking) -> Result<(), StoreError>;

    /// Append an envelope to the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    async fn enqueue(&mut self, topic: &str, routing_key: &str, event: &SerializedEvent) -> Result<(), StoreError>;

    /// Record `dedupe_key` for `consumer`. Returns `false` if it was
    /// already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    async fn mark_processed(&mut self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError>;

    /// Make every change visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is applied then.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
