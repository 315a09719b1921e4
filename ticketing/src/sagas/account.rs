//! Account lifecycle → booking.
//!
//! `account.suspended` cancels the buyer's pending bookings.
//! `account.deleted` cancels pending and confirmed ones. Each cancellation
//! is an admin cancel through the transition table, so units are released
//! and `booking.cancelled` is published per booking.
//!
//! Account events carry no version: the same buyer can be suspended again
//! after being reinstated. The ledger therefore records the envelope id, so
//! only a redelivery of the same envelope is skipped.

use super::{decode, first_delivery, wake};
use crate::aggregates::booking::{BookingAction, Outcome, Requester};
use crate::error::ReservationError;
use crate::events::{EventPayload, topics};
use crate::store::TicketStore;
use crate::transition::BookingTransitions;
use crate::types::{BookingStatus, BuyerId};
use async_trait::async_trait;
use boxoffice_core::environment::Clock;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::Subscription;
use boxoffice_runtime::{HandlerError, MessageHandler};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Consumer and queue name.
pub const CONSUMER: &str = "booking-accounts";

const SUSPENDED_CANCELS: &[BookingStatus] = &[BookingStatus::Pending];
const DELETED_CANCELS: &[BookingStatus] = &[BookingStatus::Pending, BookingStatus::Confirmed];

/// Cancels bookings of suspended and deleted accounts.
#[derive(Clone)]
pub struct AccountSaga {
    store: Arc<dyn TicketStore>,
    transitions: BookingTransitions,
    relay_waker: Option<Arc<Notify>>,
}

impl AccountSaga {
    /// Creates a new `AccountSaga`
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, transitions: BookingTransitions::new(clock), relay_waker: None }
    }

    /// Wake the outbox relay after cancellations commit.
    #[must_use]
    pub fn with_relay_waker(mut self, waker: Arc<Notify>) -> Self {
        self.relay_waker = Some(waker);
        self
    }

    /// `user_events` / `account.*` on the `booking-accounts` queue.
    #[must_use]
    pub fn subscription() -> Subscription {
        Subscription::new(CONSUMER).bind(topics::USER_EVENTS, "account.*")
    }

    async fn cancel_bookings(
        &self,
        envelope: &SerializedEvent,
        buyer_id: BuyerId,
        statuses: &[BookingStatus],
        reason: &str,
    ) -> Result<usize, ReservationError> {
        let mut uow = self.store.begin().await?;
        if !first_delivery(uow.as_mut(), CONSUMER, &envelope.event_id.to_string()).await? {
            return Ok(0);
        }

        let mut cancelled = 0;
        for mut booking in uow.lock_bookings_for_buyer(buyer_id, statuses).await? {
            let action = BookingAction::Cancel { requested_by: Requester::Admin, reason: reason.to_string() };
            let outcome = self
                .transitions
                .apply(uow.as_mut(), &mut booking, action, Some(envelope.event_id))
                .await?;
            if let Outcome::Applied { .. } = outcome {
                cancelled += 1;
            }
        }
        uow.commit().await?;

        if cancelled > 0 {
            wake(self.relay_waker.as_ref());
        }
        Ok(cancelled)
    }
}

#[async_trait]
impl MessageHandler for AccountSaga {
    #[tracing::instrument(skip_all, fields(event_type = %envelope.event_type, dedupe_key = %envelope.dedupe_key))]
    async fn handle(&self, envelope: &SerializedEvent) -> Result<(), HandlerError> {
        let (buyer_id, statuses, reason) = match decode(envelope)? {
            EventPayload::AccountSuspended { buyer_id } => (buyer_id, SUSPENDED_CANCELS, "account suspended"),
            EventPayload::AccountDeleted { buyer_id } => (buyer_id, DELETED_CANCELS, "account deleted"),
            _ => {
                debug!(event_type = %envelope.event_type, "No booking change for event");
                return Ok(());
            }
        };

        let cancelled = self.cancel_bookings(envelope, buyer_id, statuses, reason).await?;
        info!(%buyer_id, cancelled, reason, "Account bookings cancelled");
        Ok(())
    }
}
