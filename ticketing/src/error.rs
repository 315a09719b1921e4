//! Errors returned by the reservation service and the saga handlers.

use crate::store::StoreError;
use crate::types::BookingStatus;
use boxoffice_core::event::EventError;
use boxoffice_core::event_bus::EventBusError;
use boxoffice_runtime::HandlerError;
use thiserror::Error;

/// Reservation service error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// Fewer units of a type were claimable than requested
    #[error("Insufficient inventory for {ticket_type}: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Type label
        ticket_type: String,
        /// Units requested
        requested: u32,
        /// Units that could be claimed
        available: u32,
    },

    /// Empty line items or a zero quantity
    #[error("Quantity must be greater than zero")]
    InvalidQuantity,

    /// No such event
    #[error("Event not found")]
    EventNotFound,

    /// The event exists but is not on sale
    #[error("Event not sellable: {0}")]
    EventNotSellable(String),

    /// No such booking (or not visible to the caller)
    #[error("Booking not found")]
    BookingNotFound,

    /// The transition table has no such edge
    #[error("Invalid booking transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: BookingStatus,
        /// Requested status
        to: BookingStatus,
    },

    /// An inbound event refers to a booking that does not exist (yet)
    #[error("Unknown correlation: no booking for inbound event")]
    UnknownCorrelation,

    /// Booking total does not fit in the money type
    #[error("Price overflow")]
    PriceOverflow,

    /// Store, bus or encoding trouble; retrying may help
    #[error("Infrastructure error: {0}")]
    TransientInfrastructure(String),
}

impl ReservationError {
    /// Label used for the `reason` metric tag.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InsufficientInventory { .. } => "insufficient_inventory",
            Self::InvalidQuantity => "invalid_quantity",
            Self::EventNotFound => "event_not_found",
            Self::EventNotSellable(_) => "event_not_sellable",
            Self::BookingNotFound => "booking_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownCorrelation => "unknown_correlation",
            Self::PriceOverflow => "price_overflow",
            Self::TransientInfrastructure(_) => "infrastructure",
        }
    }
}

impl From<StoreError> for ReservationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InsufficientInventory { ticket_type, requested, available } => {
                Self::InsufficientInventory { ticket_type, requested, available }
            }
            StoreError::InvalidQuantity => Self::InvalidQuantity,
            other => Self::TransientInfrastructure(other.to_string()),
        }
    }
}

impl From<EventBusError> for ReservationError {
    fn from(error: EventBusError) -> Self {
        Self::TransientInfrastructure(error.to_string())
    }
}

impl From<EventError> for ReservationError {
    fn from(error: EventError) -> Self {
        Self::TransientInfrastructure(error.to_string())
    }
}

impl From<ReservationError> for HandlerError {
    /// Unknown correlations and infrastructure trouble are retried up to
    /// the ceiling; everything else can never succeed.
    fn from(error: ReservationError) -> Self {
        match error {
            ReservationError::UnknownCorrelation | ReservationError::TransientInfrastructure(_) => {
                Self::Retry(error.to_string())
            }
            other => Self::DeadLetter(other.to_string()),
        }
    }
}
