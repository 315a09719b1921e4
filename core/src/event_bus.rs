//! Event bus abstraction for cross-service communication.
//!
//! Services never share a transaction. A state change is committed locally
//! together with an outbox row, the outbox relay publishes it here, and the
//! consuming service reacts through its own idempotent handler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  1. Local tx    │
//! │ (state+outbox)  │◄─── Source of truth
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ 2. Publish to   │
//! │    Event Bus    │◄─── At-least-once delivery
//! └────────┬────────┘
//!          │
//!     ┌────┴────┐
//!     │         │
//!     ▼         ▼
//! ┌───────┐ ┌────────┐
//! │ Saga  │ │ Notify │
//! └───────┘ └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a [`Delivery`] stays owned by the consumer
//!   until it is acked; dropped or nacked deliveries come back
//! - **Idempotency**: subscribers deduplicate on [`SerializedEvent::dedupe_key`]
//! - **No cross-key ordering**: handlers must tolerate a late predecessor
//!
//! # Topics and routing keys
//!
//! Topics play the role of topic exchanges (`payment_events`,
//! `ticket_events`, ...). The routing key is the event type. A
//! [`Subscription`] names a queue (shared by competing consumers) and binds
//! it to one or more `(topic, pattern)` pairs; see [`crate::routing`].

use crate::event::SerializedEvent;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue that failed to subscribe
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to acknowledge a delivery
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A named queue bound to one or more topics by routing key pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    queue: String,
    bindings: Vec<(String, String)>,
}

impl Subscription {
    /// Start a subscription for `queue`.
    ///
    /// Consumers sharing a queue name compete for its deliveries.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            bindings: Vec::new(),
        }
    }

    /// Bind the queue to `topic` for routing keys matching `pattern`.
    #[must_use]
    pub fn bind(mut self, topic: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.bindings.push((topic.into(), pattern.into()));
        self
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Distinct topics this subscription listens to.
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.bindings.iter().map(|(t, _)| t.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }

    /// Whether a message published to `topic` with `routing_key` is routed
    /// to this queue.
    #[must_use]
    pub fn accepts(&self, topic: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|(t, pattern)| t == topic && crate::routing::matches(pattern, routing_key))
    }
}

/// Settles a single delivery with the broker.
///
/// Implementations are created by the bus for each delivery. Exactly one of
/// the two methods is called; if neither is (the [`Delivery`] is dropped),
/// the broker must eventually redeliver.
pub trait Acknowledger: Send {
    /// Remove the delivery from the queue.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>>;

    /// Reject the delivery; with `requeue` it is delivered again later with
    /// an incremented attempt counter, otherwise it is discarded.
    fn nack(self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), EventBusError>>;
}

/// One delivery of an event to a subscriber.
pub struct Delivery {
    event: SerializedEvent,
    topic: String,
    routing_key: String,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Assemble a delivery. Used by event bus implementations.
    #[must_use]
    pub fn new(
        event: SerializedEvent,
        topic: impl Into<String>,
        routing_key: impl Into<String>,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            event,
            topic: topic.into(),
            routing_key: routing_key.into(),
            attempt,
            acker,
        }
    }

    /// The delivered envelope.
    #[must_use]
    pub const fn event(&self) -> &SerializedEvent {
        &self.event
    }

    /// Topic the event was published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Routing key the event was published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Delivery attempt, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AckFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), EventBusError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge, optionally asking for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AckFailed`] if the broker rejects the nack.
    pub async fn nack(self, requeue: bool) -> Result<(), EventBusError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("topic", &self.topic)
            .field("routing_key", &self.routing_key)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`), so the bus can be
/// injected into services and handlers.
///
/// # Examples
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let subscription = Subscription::new("booking-payments").bind("payment_events", "payment.*");
/// let mut stream = event_bus.subscribe(&subscription).await?;
///
/// while let Some(delivery) = stream.next().await {
///     let delivery = delivery?;
///     match process(delivery.event()).await {
///         Ok(()) => delivery.ack().await?,
///         Err(_) => delivery.nack(true).await?,
///     }
/// }
/// ```
pub trait EventBus: Send + Sync {
    /// Publish an event to `topic` with `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        event: &SerializedEvent,
    ) -> BoxFuture<'_, Result<(), EventBusError>>;

    /// Subscribe a queue and receive its deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> BoxFuture<'_, Result<DeliveryStream, EventBusError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_routes_by_topic_and_pattern() {
        let subscription = Subscription::new("notifications")
            .bind("ticket_events", "booking.*")
            .bind("payment_events", "payment.completed");

        assert!(subscription.accepts("ticket_events", "booking.cancelled"));
        assert!(subscription.accepts("payment_events", "payment.completed"));
        assert!(!subscription.accepts("payment_events", "payment.created"));
        assert!(!subscription.accepts("user_events", "booking.created"));
        assert_eq!(subscription.topics(), vec!["payment_events", "ticket_events"]);
    }

    #[test]
    fn event_bus_is_dyn_compatible() {
        fn assert_object(_: Option<&dyn EventBus>) {}
        assert_object(None);
    }
}
