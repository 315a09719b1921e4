//! Idempotent consumers for events from the other services.
//!
//! Every handler follows the same shape:
//!
//! 1. decode the payload; undecodable envelopes are dead-lettered at once
//! 2. open a unit of work and record the delivery key in the
//!    `processed_events` ledger under the handler's consumer name; a key
//!    that is already there means a redelivery, so commit nothing and ack
//! 3. lock the correlated booking(s) and run the transition table
//! 4. commit, then ack
//!
//! A booking that does not exist yet is a retry, not a failure: payment
//! events can overtake the `booking.created` commit they refer to.

use crate::events::EventPayload;
use crate::store::UnitOfWork;
use boxoffice_core::event::SerializedEvent;
use boxoffice_runtime::HandlerError;
use std::sync::Arc;
use tokio::sync::Notify;

pub mod account;
pub mod notification;
pub mod payment;

pub use account::AccountSaga;
pub use notification::{LogNotificationSender, Notification, NotificationSaga, NotificationSender};
pub use payment::PaymentSaga;

fn decode(envelope: &SerializedEvent) -> Result<EventPayload, HandlerError> {
    envelope.decode::<EventPayload>().map_err(|error| {
        tracing::warn!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            %error,
            "Undecodable event"
        );
        HandlerError::DeadLetter(format!("undecodable {}: {error}", envelope.event_type))
    })
}

/// Record `key` in `consumer`'s ledger. `false` means it was seen before
/// and the caller must skip its work.
async fn first_delivery(
    uow: &mut dyn UnitOfWork,
    consumer: &'static str,
    key: &str,
) -> Result<bool, crate::error::ReservationError> {
    if uow.mark_processed(consumer, key).await? {
        return Ok(true);
    }
    skipped_duplicate(consumer, key);
    Ok(false)
}

fn skipped_duplicate(consumer: &'static str, key: &str) {
    tracing::debug!(consumer, key, "Duplicate delivery skipped");
    metrics::counter!("consumer_duplicates_skipped_total", "consumer" => consumer).increment(1);
}

fn wake(waker: Option<&Arc<Notify>>) {
    if let Some(waker) = waker {
        waker.notify_one();
    }
}
