//! Transactional outbox seam.
//!
//! Services write [`OutboxMessage`]s in the same local transaction as the
//! state change they describe. A relay then reads pending messages in order,
//! publishes them to the [`EventBus`](crate::event_bus::EventBus) and marks
//! them published. A crash between publish and mark only causes a duplicate
//! delivery, which consumers already tolerate.

use crate::event::SerializedEvent;
use crate::event_bus::BoxFuture;
use thiserror::Error;

/// Errors raised by an outbox store.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// The backing store could not be read or written
    #[error("Outbox storage error: {0}")]
    Storage(String),
}

/// An event waiting to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Monotonic position in the outbox
    pub id: i64,
    /// Topic to publish to
    pub topic: String,
    /// Routing key to publish with
    pub routing_key: String,
    /// The envelope itself
    pub event: SerializedEvent,
}

/// Read side of the outbox, used by the relay.
pub trait Outbox: Send + Sync {
    /// Oldest unpublished messages, at most `limit`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the outbox cannot be read.
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>>;

    /// Mark messages as published so they are not relayed again.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the outbox cannot be updated.
    fn mark_published(&self, ids: &[i64]) -> BoxFuture<'_, Result<(), OutboxError>>;
}
