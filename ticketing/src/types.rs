//! Domain types for the ticketing service.
//!
//! Value objects (identifiers, [`Money`]) and the inventory records the
//! store hands out. The booking itself lives in
//! [`aggregates::booking`](crate::aggregates::booking) because its status
//! may only change through the reducer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a sellable event (a show)
    EventId
);
uuid_id!(
    /// Unique identifier for one ticket unit
    TicketUnitId
);
uuid_id!(
    /// Unique identifier for a booking
    BookingId
);
uuid_id!(
    /// Unique identifier for a buyer account
    BuyerId
);
uuid_id!(
    /// Payment identity assigned by the payment service
    PaymentId
);

// ============================================================================
// Money
// ============================================================================

/// Amount in integer cents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero cents.
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Adds two amounts, `None` on overflow
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(sum) => Some(Self(sum)),
            None => None,
        }
    }

    /// Sum of `amounts`, `None` on overflow
    pub fn checked_sum<I>(amounts: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Status enums
// ============================================================================

/// A status string read from storage that this build does not know.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    /// Which status enum was being parsed
    pub kind: &'static str,
    /// The rejected value
    pub value: String,
}

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Storage and wire form
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Where a ticket unit is in its sale lifecycle
    UnitStatus, "unit" {
        /// Free to claim
        Available => "available",
        /// Held by a pending booking
        Reserved => "reserved",
        /// Paid for
        Sold => "sold",
    }
);

status_enum!(
    /// Lifecycle of a sellable event
    EventStatus, "event" {
        /// On sale
        Active => "active",
        /// Called off
        Cancelled => "cancelled",
        /// Already happened
        Completed => "completed",
    }
);

status_enum!(
    /// Lifecycle of a booking
    BookingStatus, "booking" {
        /// Units claimed, waiting for payment
        Pending => "pending",
        /// Paid, units sold
        Confirmed => "confirmed",
        /// Cancelled by payment failure, the buyer or an admin
        Cancelled => "cancelled",
        /// Refunded after confirmation
        Refunded => "refunded",
    }
);

impl BookingStatus {
    /// No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }
}

// ============================================================================
// Inventory records
// ============================================================================

/// A sellable show.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identity
    pub id: EventId,
    /// Display name
    pub name: String,
    /// Venue name
    pub venue: String,
    /// When doors open
    pub starts_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: EventStatus,
    /// When the event was stocked
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create an active event.
    #[must_use]
    pub fn new(name: impl Into<String>, venue: impl Into<String>, starts_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            venue: venue.into(),
            starts_at,
            status: EventStatus::Active,
            created_at: now,
        }
    }

    /// Why tickets for this event cannot be sold at `now`, if they cannot.
    #[must_use]
    pub fn unsellable_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.status != EventStatus::Active {
            Some("event is not active")
        } else if self.starts_at <= now {
            Some("event has already started")
        } else {
            None
        }
    }
}

/// One physically sellable slot.
///
/// Status and owner only change through the inventory operations of a unit
/// of work (claim, confirm, release); outside the crate they are read-only.
///
/// ```compile_fail
/// use ticketing::types::{EventId, Money, TicketUnit, UnitStatus};
///
/// let mut unit = TicketUnit::available(EventId::new(), "GA", Money::from_cents(5_000));
/// unit.status = UnitStatus::Sold;
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketUnit {
    /// Identity
    pub id: TicketUnitId,
    /// Event this unit admits to
    pub event_id: EventId,
    /// Type label (e.g. `VIP`)
    pub ticket_type: String,
    /// Unit price
    pub price: Money,
    status: UnitStatus,
    booking_id: Option<BookingId>,
    buyer_id: Option<BuyerId>,
}

impl TicketUnit {
    /// A fresh available unit.
    #[must_use]
    pub fn available(event_id: EventId, ticket_type: impl Into<String>, price: Money) -> Self {
        Self {
            id: TicketUnitId::new(),
            event_id,
            ticket_type: ticket_type.into(),
            price,
            status: UnitStatus::Available,
            booking_id: None,
            buyer_id: None,
        }
    }

    /// Rebuild a unit from storage.
    pub(crate) const fn restore(
        id: TicketUnitId,
        event_id: EventId,
        ticket_type: String,
        price: Money,
        status: UnitStatus,
        booking_id: Option<BookingId>,
        buyer_id: Option<BuyerId>,
    ) -> Self {
        Self { id, event_id, ticket_type, price, status, booking_id, buyer_id }
    }

    /// Sale status.
    #[must_use]
    pub const fn status(&self) -> UnitStatus {
        self.status
    }

    /// Owning booking, set while reserved or sold.
    #[must_use]
    pub const fn booking_id(&self) -> Option<BookingId> {
        self.booking_id
    }

    /// Owning buyer, set while reserved or sold.
    #[must_use]
    pub const fn buyer_id(&self) -> Option<BuyerId> {
        self.buyer_id
    }

    /// Owner fields agree with the status.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        match self.status {
            UnitStatus::Available => self.booking_id.is_none() && self.buyer_id.is_none(),
            UnitStatus::Reserved | UnitStatus::Sold => self.booking_id.is_some() && self.buyer_id.is_some(),
        }
    }

    pub(crate) fn assign(&mut self, booking_id: BookingId, buyer_id: BuyerId) {
        self.status = UnitStatus::Reserved;
        self.booking_id = Some(booking_id);
        self.buyer_id = Some(buyer_id);
    }

    pub(crate) fn sell(&mut self) {
        self.status = UnitStatus::Sold;
    }

    pub(crate) fn unassign(&mut self) {
        self.status = UnitStatus::Available;
        self.booking_id = None;
        self.buyer_id = None;
    }
}

/// How many units of one type to put on sale when stocking an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketTypeStock {
    /// Type label
    pub ticket_type: String,
    /// Unit price
    pub price: Money,
    /// Number of units
    pub quantity: u32,
}

/// One requested line of a booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Type label
    pub ticket_type: String,
    /// Units wanted
    pub quantity: u32,
}

impl LineItem {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(ticket_type: impl Into<String>, quantity: u32) -> Self {
        Self { ticket_type: ticket_type.into(), quantity }
    }
}

/// Available units per type and price.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAvailability {
    /// Type label
    pub ticket_type: String,
    /// Unit price
    pub price: Money,
    /// Units still available
    pub available: u32,
}

/// Page request for list queries. `page` starts at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    page: u32,
    page_size: u32,
}

impl Page {
    /// Largest page size served.
    pub const MAX_SIZE: u32 = 100;

    /// Build a page request, clamping `page` to at least 1 and `page_size`
    /// to `1..=100`.
    #[must_use]
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page: page.max(1), page_size: page_size.clamp(1, Self::MAX_SIZE) }
    }

    /// 1-based page number
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.page
    }

    /// Rows per page
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.page_size
    }

    /// Rows to skip
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}
