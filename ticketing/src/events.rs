//! Event catalog exchanged with the other services.
//!
//! [`EventPayload`] is closed: one variant per event type, so handlers match
//! exhaustively. It uses serde's external tagging because the envelope
//! payload is bincode.
//!
//! Routing keys are the event types. Topics:
//!
//! | Topic | Events |
//! |---|---|
//! | `ticket_events` | `booking.created`, `booking.updated`, `booking.cancelled` |
//! | `payment_events` | `payment.created`, `payment.completed`, `payment.failed`, `payment.refunded` |
//! | `user_events` | `account.suspended`, `account.deleted` |
//! | `notification_events` | reserved for the notification service |

use crate::types::{BookingId, BookingStatus, BuyerId, EventId, Money, PaymentId};
use boxoffice_core::event::Event;
use serde::{Deserialize, Serialize};

/// Topic names.
pub mod topics {
    /// Account lifecycle events
    pub const USER_EVENTS: &str = "user_events";
    /// Booking events published by this service
    pub const TICKET_EVENTS: &str = "ticket_events";
    /// Payment outcomes
    pub const PAYMENT_EVENTS: &str = "payment_events";
    /// Notification service events
    pub const NOTIFICATION_EVENTS: &str = "notification_events";
}

/// Fields shared by every payment event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Payment identity
    pub payment_id: PaymentId,
    /// Booking being paid for
    pub booking_id: BookingId,
    /// Paying buyer
    pub buyer_id: BuyerId,
    /// Amount charged
    pub amount: Money,
    /// ISO currency code
    pub currency: String,
}

/// Every event this service publishes or consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A pending booking was created
    BookingCreated {
        /// Booking identity
        booking_id: BookingId,
        /// Owner
        buyer_id: BuyerId,
        /// Event booked
        event_id: EventId,
        /// Always pending at creation
        status: BookingStatus,
        /// Sum of the claimed unit prices
        total_price: Money,
        /// Booking version at creation
        version: u32,
    },

    /// A booking changed status
    BookingUpdated {
        /// Booking identity
        booking_id: BookingId,
        /// New status
        status: BookingStatus,
        /// Booking version after the change
        version: u32,
    },

    /// A booking was cancelled and its units released
    BookingCancelled {
        /// Booking identity
        booking_id: BookingId,
        /// Owner
        buyer_id: BuyerId,
        /// Event booked
        event_id: EventId,
        /// Booking version after the change
        version: u32,
    },

    /// Payment intent created; informational
    PaymentCreated(PaymentDetails),

    /// Payment captured
    PaymentCompleted(PaymentDetails),

    /// Payment declined or errored
    PaymentFailed {
        /// Payment fields
        payment: PaymentDetails,
        /// Decline reason
        reason: String,
    },

    /// Captured payment returned to the buyer
    PaymentRefunded(PaymentDetails),

    /// Account suspended by an operator
    AccountSuspended {
        /// Suspended buyer
        buyer_id: BuyerId,
    },

    /// Account deleted
    AccountDeleted {
        /// Deleted buyer
        buyer_id: BuyerId,
    },
}

impl EventPayload {
    /// Topic this event is published on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } | Self::BookingUpdated { .. } | Self::BookingCancelled { .. } => {
                topics::TICKET_EVENTS
            }
            Self::PaymentCreated(_)
            | Self::PaymentCompleted(_)
            | Self::PaymentFailed { .. }
            | Self::PaymentRefunded(_) => topics::PAYMENT_EVENTS,
            Self::AccountSuspended { .. } | Self::AccountDeleted { .. } => topics::USER_EVENTS,
        }
    }

    /// Payment fields, for payment events.
    #[must_use]
    pub const fn payment(&self) -> Option<&PaymentDetails> {
        match self {
            Self::PaymentCreated(payment)
            | Self::PaymentCompleted(payment)
            | Self::PaymentRefunded(payment)
            | Self::PaymentFailed { payment, .. } => Some(payment),
            _ => None,
        }
    }
}

impl Event for EventPayload {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "booking.created",
            Self::BookingUpdated { .. } => "booking.updated",
            Self::BookingCancelled { .. } => "booking.cancelled",
            Self::PaymentCreated(_) => "payment.created",
            Self::PaymentCompleted(_) => "payment.completed",
            Self::PaymentFailed { .. } => "payment.failed",
            Self::PaymentRefunded(_) => "payment.refunded",
            Self::AccountSuspended { .. } => "account.suspended",
            Self::AccountDeleted { .. } => "account.deleted",
        }
    }

    fn dedupe_key(&self) -> String {
        let event_type = self.event_type();
        match self {
            Self::BookingCreated { booking_id, version, .. }
            | Self::BookingUpdated { booking_id, version, .. }
            | Self::BookingCancelled { booking_id, version, .. } => {
                format!("{booking_id}:{event_type}:{version}")
            }
            Self::PaymentCreated(payment)
            | Self::PaymentCompleted(payment)
            | Self::PaymentRefunded(payment)
            | Self::PaymentFailed { payment, .. } => format!("{}:{event_type}", payment.payment_id),
            // Not unique per occurrence; consumers dedupe these by envelope id.
            Self::AccountSuspended { buyer_id } | Self::AccountDeleted { buyer_id } => {
                format!("{buyer_id}:{event_type}")
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use boxoffice_core::event::SerializedEvent;
    use chrono::Utc;

    fn payment() -> PaymentDetails {
        PaymentDetails {
            payment_id: PaymentId::new(),
            booking_id: BookingId::new(),
            buyer_id: BuyerId::new(),
            amount: Money::from_cents(10_000),
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn dedupe_keys_follow_the_subject() {
        let booking_id = BookingId::new();
        let updated = EventPayload::BookingUpdated { booking_id, status: BookingStatus::Confirmed, version: 2 };
        assert_eq!(updated.dedupe_key(), format!("{booking_id}:booking.updated:2"));

        let details = payment();
        let completed = EventPayload::PaymentCompleted(details.clone());
        assert_eq!(completed.dedupe_key(), format!("{}:payment.completed", details.payment_id));

        let buyer_id = BuyerId::new();
        assert_eq!(EventPayload::AccountDeleted { buyer_id }.dedupe_key(), format!("{buyer_id}:account.deleted"));
    }

    #[test]
    fn same_payment_different_outcomes_have_distinct_keys() {
        let details = payment();
        let failed = EventPayload::PaymentFailed { payment: details.clone(), reason: "declined".into() };
        let refunded = EventPayload::PaymentRefunded(details);
        assert_ne!(failed.dedupe_key(), refunded.dedupe_key());
    }

    #[test]
    fn payload_survives_the_envelope() {
        let event = EventPayload::PaymentFailed { payment: payment(), reason: "card declined".into() };
        let envelope = SerializedEvent::from_event(&event, Utc::now()).expect("encode");

        assert_eq!(envelope.event_type, "payment.failed");
        assert_eq!(event.topic(), topics::PAYMENT_EVENTS);
        assert_eq!(envelope.decode::<EventPayload>().expect("decode"), event);
    }
}
