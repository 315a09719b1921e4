//! Payment outcome → booking.
//!
//! | Event | Action |
//! |---|---|
//! | `payment.completed` | confirm, record the payment id |
//! | `payment.failed` | cancel, release units |
//! | `payment.refunded` | refund, release units |
//! | `payment.created` | ack, nothing to do |

use super::{decode, first_delivery, wake};
use crate::aggregates::booking::{BookingAction, Outcome};
use crate::error::ReservationError;
use crate::events::{EventPayload, PaymentDetails, topics};
use crate::store::TicketStore;
use crate::transition::BookingTransitions;
use async_trait::async_trait;
use boxoffice_core::environment::Clock;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::Subscription;
use boxoffice_runtime::{HandlerError, MessageHandler};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Consumer and queue name.
pub const CONSUMER: &str = "booking-payments";

/// Drives bookings from payment outcomes.
#[derive(Clone)]
pub struct PaymentSaga {
    store: Arc<dyn TicketStore>,
    transitions: BookingTransitions,
    relay_waker: Option<Arc<Notify>>,
}

impl PaymentSaga {
    /// Creates a new `PaymentSaga`
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, transitions: BookingTransitions::new(clock), relay_waker: None }
    }

    /// Wake the outbox relay after a transition commits.
    #[must_use]
    pub fn with_relay_waker(mut self, waker: Arc<Notify>) -> Self {
        self.relay_waker = Some(waker);
        self
    }

    /// `payment_events` / `payment.*` on the `booking-payments` queue.
    #[must_use]
    pub fn subscription() -> Subscription {
        Subscription::new(CONSUMER).bind(topics::PAYMENT_EVENTS, "payment.*")
    }

    async fn apply(
        &self,
        envelope: &SerializedEvent,
        payment: &PaymentDetails,
        action: BookingAction,
    ) -> Result<(), ReservationError> {
        let mut uow = self.store.begin().await?;
        if !first_delivery(uow.as_mut(), CONSUMER, &envelope.dedupe_key).await? {
            return Ok(());
        }

        // Dropping the unit of work also forgets the ledger entry, so the
        // retry gets another chance once the booking exists.
        let mut booking = uow
            .lock_booking(payment.booking_id)
            .await?
            .ok_or(ReservationError::UnknownCorrelation)?;

        let outcome = self
            .transitions
            .apply(uow.as_mut(), &mut booking, action, Some(envelope.event_id))
            .await?;
        uow.commit().await?;

        if let Outcome::Applied { .. } = outcome {
            wake(self.relay_waker.as_ref());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PaymentSaga {
    #[tracing::instrument(skip_all, fields(event_type = %envelope.event_type, dedupe_key = %envelope.dedupe_key))]
    async fn handle(&self, envelope: &SerializedEvent) -> Result<(), HandlerError> {
        let (payment, action) = match decode(envelope)? {
            EventPayload::PaymentCompleted(payment) => {
                let payment_id = payment.payment_id;
                (payment, BookingAction::PaymentCompleted { payment_id })
            }
            EventPayload::PaymentFailed { payment, reason } => (payment, BookingAction::PaymentFailed { reason }),
            EventPayload::PaymentRefunded(payment) => (payment, BookingAction::PaymentRefunded),
            other => {
                debug!(event_type = %envelope.event_type, payment = ?other.payment().map(|p| p.payment_id), "No booking change for event");
                return Ok(());
            }
        };

        self.apply(envelope, &payment, action).await.map_err(|error| {
            tracing::warn!(booking_id = %payment.booking_id, %error, "Payment outcome not applied");
            HandlerError::from(error)
        })
    }
}
