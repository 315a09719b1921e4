//! Booking aggregate.
//!
//! A booking binds one buyer, one event and the units claimed for it into a
//! priced order. Its status only moves along this table:
//!
//! ```text
//! pending   --payment completed-->  confirmed   ConfirmUnits
//! pending   --payment failed----->  cancelled   ReleaseUnits
//! pending   --buyer/admin cancel->  cancelled   ReleaseUnits
//! confirmed --payment refunded--->  refunded    ReleaseUnits
//! confirmed --admin cancel------->  cancelled   ReleaseUnits
//! cancelled | refunded: terminal, everything is a no-op
//! ```
//!
//! Anything off the table, including a repeat of an applied trigger, yields
//! [`Outcome::Ignored`] and no effects. That is what makes redelivered saga
//! events harmless.

use crate::events::EventPayload;
use crate::types::{BookingId, BookingStatus, BuyerId, EventId, Money, PaymentId};
use boxoffice_core::environment::Clock;
use boxoffice_core::reducer::Reducer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

/// Who asked for a cancel or status change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requester {
    /// The booking's owner
    Buyer,
    /// An operator, or the account saga acting for one
    Admin,
}

/// One buyer's order for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    buyer_id: BuyerId,
    event_id: EventId,
    status: BookingStatus,
    total_price: Money,
    payment_id: Option<PaymentId>,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Booking {
    /// A freshly created pending booking at version 1.
    #[must_use]
    pub const fn pending(
        id: BookingId,
        buyer_id: BuyerId,
        event_id: EventId,
        total_price: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            buyer_id,
            event_id,
            status: BookingStatus::Pending,
            total_price,
            payment_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a booking from storage.
    #[allow(clippy::too_many_arguments)]
    pub(crate) const fn restore(
        id: BookingId,
        buyer_id: BuyerId,
        event_id: EventId,
        status: BookingStatus,
        total_price: Money,
        payment_id: Option<PaymentId>,
        version: u32,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, buyer_id, event_id, status, total_price, payment_id, version, created_at, updated_at }
    }

    /// Identity
    #[must_use]
    pub const fn id(&self) -> BookingId {
        self.id
    }

    /// Owner
    #[must_use]
    pub const fn buyer_id(&self) -> BuyerId {
        self.buyer_id
    }

    /// Event booked
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> BookingStatus {
        self.status
    }

    /// Sum of the claimed unit prices
    #[must_use]
    pub const fn total_price(&self) -> Money {
        self.total_price
    }

    /// Payment that confirmed this booking
    #[must_use]
    pub const fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    /// Incremented on every applied transition
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Creation time
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last transition time
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The `booking.created` event for this booking.
    #[must_use]
    pub const fn created_event(&self) -> EventPayload {
        EventPayload::BookingCreated {
            booking_id: self.id,
            buyer_id: self.buyer_id,
            event_id: self.event_id,
            status: self.status,
            total_price: self.total_price,
            version: self.version,
        }
    }

    /// Where `action` would take this booking, if anywhere.
    #[must_use]
    pub fn outcome(&self, action: &BookingAction) -> Outcome {
        use BookingStatus::{Cancelled, Confirmed, Pending, Refunded};

        let target = match (self.status, action) {
            (Pending, BookingAction::PaymentCompleted { .. }) => Some(Confirmed),
            (Pending, BookingAction::PaymentFailed { .. } | BookingAction::Cancel { .. })
            | (Confirmed, BookingAction::Cancel { requested_by: Requester::Admin, .. }) => Some(Cancelled),
            (Confirmed, BookingAction::PaymentRefunded) => Some(Refunded),
            (from, BookingAction::SetStatus { target, requested_by }) => {
                edge_exists(from, *target, *requested_by).then_some(*target)
            }
            _ => None,
        };

        target.map_or(Outcome::Ignored, |to| Outcome::Applied { from: self.status, to })
    }
}

/// Whether the table has an edge `from -> to` that `requested_by` may take.
const fn edge_exists(from: BookingStatus, to: BookingStatus, requested_by: Requester) -> bool {
    use BookingStatus::{Cancelled, Confirmed, Pending, Refunded};

    matches!(
        (from, to, requested_by),
        (Pending, Cancelled, _)
            | (Pending, Confirmed, Requester::Admin)
            | (Confirmed, Refunded, Requester::Admin)
            | (Confirmed, Cancelled, Requester::Admin)
    )
}

/// Result of offering an action to a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The status moved along an edge
    Applied {
        /// Status before
        from: BookingStatus,
        /// Status after
        to: BookingStatus,
    },
    /// No edge matched; nothing changed
    Ignored,
}

/// Triggers offered to a booking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingAction {
    /// `payment.completed` arrived
    PaymentCompleted {
        /// Captured payment
        payment_id: PaymentId,
    },

    /// `payment.failed` arrived
    PaymentFailed {
        /// Decline reason
        reason: String,
    },

    /// `payment.refunded` arrived
    PaymentRefunded,

    /// Explicit cancel
    Cancel {
        /// Who is cancelling
        requested_by: Requester,
        /// Free-form reason for the log
        reason: String,
    },

    /// Admin status override, restricted to the table's edges
    SetStatus {
        /// Desired status
        target: BookingStatus,
        /// Who is asking
        requested_by: Requester,
    },
}

/// Work the imperative shell performs after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingEffect {
    /// Flip the booking's reserved units to sold
    ConfirmUnits,
    /// Return the booking's units to the available pool
    ReleaseUnits,
    /// Enqueue an event in the outbox
    Publish(EventPayload),
}

/// Injected dependencies.
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for `updated_at`
    pub clock: Arc<dyn Clock>,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

/// Pure transition function for [`Booking`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Reducer for BookingReducer {
    type State = Booking;
    type Action = BookingAction;
    type Environment = BookingEnvironment;
    type Effect = BookingEffect;

    fn reduce(
        &self,
        booking: &mut Booking,
        action: BookingAction,
        env: &BookingEnvironment,
    ) -> SmallVec<[BookingEffect; 4]> {
        let Outcome::Applied { to, .. } = booking.outcome(&action) else {
            return SmallVec::new();
        };

        booking.status = to;
        booking.version = booking.version.saturating_add(1);
        booking.updated_at = env.clock.now();
        if let BookingAction::PaymentCompleted { payment_id } = action {
            booking.payment_id = Some(payment_id);
        }

        let updated = BookingEffect::Publish(EventPayload::BookingUpdated {
            booking_id: booking.id,
            status: to,
            version: booking.version,
        });

        match to {
            BookingStatus::Confirmed => smallvec![BookingEffect::ConfirmUnits, updated],
            BookingStatus::Cancelled => smallvec![
                BookingEffect::ReleaseUnits,
                updated,
                BookingEffect::Publish(EventPayload::BookingCancelled {
                    booking_id: booking.id,
                    buyer_id: booking.buyer_id,
                    event_id: booking.event_id,
                    version: booking.version,
                }),
            ],
            BookingStatus::Refunded => smallvec![BookingEffect::ReleaseUnits, updated],
            BookingStatus::Pending => smallvec![updated],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_testing::{ReducerTest, assertions, test_clock};
    use proptest::prelude::*;

    fn env() -> BookingEnvironment {
        BookingEnvironment::new(Arc::new(test_clock()))
    }

    fn pending() -> Booking {
        let created = test_clock().now() - chrono::Duration::hours(1);
        Booking::pending(BookingId::new(), BuyerId::new(), EventId::new(), Money::from_cents(20_000), created)
    }

    fn confirmed() -> Booking {
        let mut booking = pending();
        BookingReducer.reduce(&mut booking, BookingAction::PaymentCompleted { payment_id: PaymentId::new() }, &env());
        booking
    }

    fn cancel(requested_by: Requester) -> BookingAction {
        BookingAction::Cancel { requested_by, reason: "changed plans".to_string() }
    }

    #[test]
    fn payment_completed_confirms_and_records_payment() {
        let payment_id = PaymentId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(pending())
            .when_action(BookingAction::PaymentCompleted { payment_id })
            .then_state(move |booking| {
                assert_eq!(booking.status(), BookingStatus::Confirmed);
                assert_eq!(booking.payment_id(), Some(payment_id));
                assert_eq!(booking.version(), 2);
                assert_eq!(booking.updated_at(), test_clock().now());
            })
            .then_effects(|effects| {
                assert_eq!(effects.len(), 2);
                assert_eq!(effects[0], BookingEffect::ConfirmUnits);
                assert!(matches!(
                    &effects[1],
                    BookingEffect::Publish(EventPayload::BookingUpdated { status: BookingStatus::Confirmed, version: 2, .. })
                ));
            })
            .run();
    }

    #[test]
    fn payment_failed_cancels_and_releases() {
        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(pending())
            .when_action(BookingAction::PaymentFailed { reason: "card declined".to_string() })
            .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Cancelled))
            .then_effects(|effects| {
                assert_eq!(effects.len(), 3);
                assert_eq!(effects[0], BookingEffect::ReleaseUnits);
                assert!(matches!(&effects[2], BookingEffect::Publish(EventPayload::BookingCancelled { .. })));
            })
            .run();
    }

    #[test]
    fn repeated_payment_failure_is_ignored() {
        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(pending())
            .when_action(BookingAction::PaymentFailed { reason: "declined".to_string() })
            .when_action(BookingAction::PaymentFailed { reason: "declined".to_string() })
            .then_state(|booking| {
                assert_eq!(booking.status(), BookingStatus::Cancelled);
                assert_eq!(booking.version(), 2);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn refund_only_applies_to_confirmed() {
        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(pending())
            .when_action(BookingAction::PaymentRefunded)
            .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Pending))
            .then_effects(assertions::assert_no_effects)
            .run();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(confirmed())
            .when_action(BookingAction::PaymentRefunded)
            .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Refunded))
            .then_effects(|effects| {
                assert_eq!(effects[0], BookingEffect::ReleaseUnits);
                assert_eq!(effects.len(), 2);
            })
            .run();
    }

    #[test]
    fn buyer_cannot_cancel_a_confirmed_booking() {
        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(confirmed())
            .when_action(cancel(Requester::Buyer))
            .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Confirmed))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn admin_can_cancel_a_confirmed_booking() {
        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(confirmed())
            .when_action(cancel(Requester::Admin))
            .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Cancelled))
            .then_effects(|effects| assert_eq!(effects[0], BookingEffect::ReleaseUnits))
            .run();
    }

    #[test]
    fn set_status_follows_the_table() {
        let booking = pending();
        let set = |target| BookingAction::SetStatus { target, requested_by: Requester::Admin };

        assert_eq!(
            booking.outcome(&set(BookingStatus::Confirmed)),
            Outcome::Applied { from: BookingStatus::Pending, to: BookingStatus::Confirmed }
        );
        assert_eq!(booking.outcome(&set(BookingStatus::Refunded)), Outcome::Ignored);
        assert_eq!(booking.outcome(&set(BookingStatus::Pending)), Outcome::Ignored);
        assert_eq!(
            booking.outcome(&BookingAction::SetStatus { target: BookingStatus::Confirmed, requested_by: Requester::Buyer }),
            Outcome::Ignored
        );
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let mut booking = pending();
        BookingReducer.reduce(&mut booking, cancel(Requester::Buyer), &env());
        let snapshot = booking.clone();

        for action in [
            BookingAction::PaymentCompleted { payment_id: PaymentId::new() },
            BookingAction::PaymentRefunded,
            cancel(Requester::Admin),
            BookingAction::SetStatus { target: BookingStatus::Confirmed, requested_by: Requester::Admin },
        ] {
            let effects = BookingReducer.reduce(&mut booking, action, &env());
            assert!(effects.is_empty());
        }
        assert_eq!(booking, snapshot);
    }

    fn any_action() -> impl Strategy<Value = BookingAction> {
        let status = prop_oneof![
            Just(BookingStatus::Pending),
            Just(BookingStatus::Confirmed),
            Just(BookingStatus::Cancelled),
            Just(BookingStatus::Refunded),
        ];
        let requester = prop_oneof![Just(Requester::Buyer), Just(Requester::Admin)];
        prop_oneof![
            Just(BookingAction::PaymentCompleted { payment_id: PaymentId::new() }),
            Just(BookingAction::PaymentFailed { reason: "declined".to_string() }),
            Just(BookingAction::PaymentRefunded),
            requester.clone().prop_map(|requested_by| BookingAction::Cancel { requested_by, reason: String::new() }),
            (status, requester).prop_map(|(target, requested_by)| BookingAction::SetStatus { target, requested_by }),
        ]
    }

    proptest! {
        #[test]
        fn transitions_stay_on_the_table(actions in prop::collection::vec(any_action(), 0..12)) {
            let mut booking = pending();
            for action in actions {
                let before = booking.clone();
                let effects = BookingReducer.reduce(&mut booking, action, &env());

                if effects.is_empty() {
                    prop_assert_eq!(&booking, &before);
                    continue;
                }

                prop_assert!(!before.status().is_terminal());
                prop_assert_eq!(booking.version(), before.version() + 1);
                let allowed = matches!(
                    (before.status(), booking.status()),
                    (BookingStatus::Pending, BookingStatus::Confirmed | BookingStatus::Cancelled)
                        | (BookingStatus::Confirmed, BookingStatus::Refunded | BookingStatus::Cancelled)
                );
                prop_assert!(allowed);

                let releases = effects.contains(&BookingEffect::ReleaseUnits);
                prop_assert_eq!(releases, booking.status().is_terminal());
            }
        }
    }
}
