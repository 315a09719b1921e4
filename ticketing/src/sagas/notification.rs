//! Booking and payment events → buyer notifications.
//!
//! Reads `ticket_events` and `payment_events` on its own queue and never
//! touches booking state. Each event produces one [`Notification`] per
//! configured channel; the `notifications` ledger keeps redeliveries from
//! sending twice.
//!
//! Sending happens with no unit of work open. The ledger is read first and
//! written in a short unit of work after every channel went out, so a crash
//! in between resends rather than loses the notification.

use super::{decode, first_delivery, skipped_duplicate};
use crate::events::{EventPayload, topics};
use crate::store::{StoreError, TicketStore};
use crate::types::BuyerId;
use async_trait::async_trait;
use boxoffice_core::environment::Clock;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::Subscription;
use boxoffice_runtime::{HandlerError, MessageHandler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Consumer and queue name.
pub const CONSUMER: &str = "notifications";

/// What the notification is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Booking reserved
    BookingConfirmation,
    /// Payment captured
    PaymentConfirmation,
    /// Payment declined
    PaymentFailed,
    /// Booking cancelled
    BookingCancelled,
    /// Money returned
    RefundProcessed,
}

impl NotificationKind {
    /// Metric and storage label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BookingConfirmation => "booking_confirmation",
            Self::PaymentConfirmation => "payment_confirmation",
            Self::PaymentFailed => "payment_failed",
            Self::BookingCancelled => "booking_cancelled",
            Self::RefundProcessed => "refund_processed",
        }
    }
}

/// Delivery channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationChannel {
    /// Email
    Email,
    /// Text message
    Sms,
    /// Mobile push
    Push,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        })
    }
}

/// A rendered message for one buyer on one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Identity
    pub id: Uuid,
    /// Recipient
    pub buyer_id: BuyerId,
    /// Topic of the message
    pub kind: NotificationKind,
    /// Channel to send on
    pub channel: NotificationChannel,
    /// Subject line
    pub subject: String,
    /// Body text
    pub body: String,
    /// Envelope that triggered it
    pub source_event_id: Uuid,
    /// Render time
    pub created_at: DateTime<Utc>,
}

/// A channel refused or failed to send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to send {channel} notification: {reason}")]
pub struct NotificationError {
    /// Channel that failed
    pub channel: NotificationChannel,
    /// Provider error
    pub reason: String,
}

/// Hands notifications to a delivery provider.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send one notification.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] if the provider fails; the delivery is
    /// retried.
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Sender that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            notification_id = %notification.id,
            buyer_id = %notification.buyer_id,
            kind = notification.kind.as_str(),
            channel = %notification.channel,
            subject = %notification.subject,
            "Notification sent"
        );
        Ok(())
    }
}

/// Subject and body for an event, if the buyer should hear about it.
fn render(payload: &EventPayload) -> Option<(BuyerId, NotificationKind, String, String)> {
    let rendered = match payload {
        EventPayload::BookingCreated { booking_id, buyer_id, total_price, .. } => (
            *buyer_id,
            NotificationKind::BookingConfirmation,
            "Your tickets are reserved".to_string(),
            format!("Booking {booking_id} is reserved. Complete payment of {total_price} to confirm it."),
        ),
        EventPayload::BookingCancelled { booking_id, buyer_id, .. } => (
            *buyer_id,
            NotificationKind::BookingCancelled,
            "Your booking was cancelled".to_string(),
            format!("Booking {booking_id} was cancelled and its tickets released."),
        ),
        EventPayload::PaymentCompleted(payment) => (
            payment.buyer_id,
            NotificationKind::PaymentConfirmation,
            "Payment received".to_string(),
            format!(
                "We received {} {} for booking {}. Your tickets are confirmed.",
                payment.amount, payment.currency, payment.booking_id
            ),
        ),
        EventPayload::PaymentFailed { payment, reason } => (
            payment.buyer_id,
            NotificationKind::PaymentFailed,
            "Payment failed".to_string(),
            format!(
                "Payment of {} {} for booking {} failed: {reason}.",
                payment.amount, payment.currency, payment.booking_id
            ),
        ),
        EventPayload::PaymentRefunded(payment) => (
            payment.buyer_id,
            NotificationKind::RefundProcessed,
            "Refund processed".to_string(),
            format!(
                "{} {} for booking {} is on its way back to you.",
                payment.amount, payment.currency, payment.booking_id
            ),
        ),
        EventPayload::BookingUpdated { .. }
        | EventPayload::PaymentCreated(_)
        | EventPayload::AccountSuspended { .. }
        | EventPayload::AccountDeleted { .. } => return None,
    };
    Some(rendered)
}

/// Sends buyer notifications for booking and payment events.
#[derive(Clone)]
pub struct NotificationSaga {
    store: Arc<dyn TicketStore>,
    sender: Arc<dyn NotificationSender>,
    clock: Arc<dyn Clock>,
    channels: Vec<NotificationChannel>,
}

impl NotificationSaga {
    /// Creates a saga sending by email.
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, sender: Arc<dyn NotificationSender>, clock: Arc<dyn Clock>) -> Self {
        Self { store, sender, clock, channels: vec![NotificationChannel::Email] }
    }

    /// Send on these channels instead.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.channels = channels;
        self
    }

    /// `ticket_events` / `booking.*` and `payment_events` / `payment.*`
    /// on the `notifications` queue.
    #[must_use]
    pub fn subscription() -> Subscription {
        Subscription::new(CONSUMER)
            .bind(topics::TICKET_EVENTS, "booking.*")
            .bind(topics::PAYMENT_EVENTS, "payment.*")
    }
}

#[async_trait]
impl MessageHandler for NotificationSaga {
    #[tracing::instrument(skip_all, fields(event_type = %envelope.event_type, dedupe_key = %envelope.dedupe_key))]
    async fn handle(&self, envelope: &SerializedEvent) -> Result<(), HandlerError> {
        let Some((buyer_id, kind, subject, body)) = render(&decode(envelope)?) else {
            debug!(event_type = %envelope.event_type, "Nothing to notify");
            return Ok(());
        };

        let retry = |e: StoreError| HandlerError::Retry(e.to_string());
        if self.store.is_processed(CONSUMER, &envelope.dedupe_key).await.map_err(retry)? {
            skipped_duplicate(CONSUMER, &envelope.dedupe_key);
            return Ok(());
        }

        for &channel in &self.channels {
            let notification = Notification {
                id: Uuid::new_v4(),
                buyer_id,
                kind,
                channel,
                subject: subject.clone(),
                body: body.clone(),
                source_event_id: envelope.event_id,
                created_at: self.clock.now(),
            };
            self.sender
                .send(&notification)
                .await
                .map_err(|e| HandlerError::Retry(e.to_string()))?;
            metrics::counter!("notifications_sent_total", "type" => kind.as_str()).increment(1);
        }

        let mut uow = self.store.begin().await.map_err(retry)?;
        if first_delivery(uow.as_mut(), CONSUMER, &envelope.dedupe_key).await? {
            uow.commit().await.map_err(retry)?;
        }
        Ok(())
    }
}
