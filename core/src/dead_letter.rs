//! Dead-letter seam.
//!
//! A delivery that keeps failing past the retry ceiling, or that can never
//! succeed (undecodable payload), is parked here for manual inspection
//! instead of being redelivered forever.

use crate::event::SerializedEvent;
use crate::event_bus::BoxFuture;
use thiserror::Error;

/// Errors raised while parking a delivery.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The dead-letter store could not be written
    #[error("Dead-letter storage error: {0}")]
    Storage(String),
}

/// A delivery that gave up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Queue (consumer) that failed to process the event
    pub queue: String,
    /// Topic the event came from
    pub topic: String,
    /// Routing key of the delivery
    pub routing_key: String,
    /// The envelope that failed
    pub event: SerializedEvent,
    /// Number of delivery attempts made
    pub attempts: u32,
    /// Last processing error
    pub error: String,
}

/// Destination for dead-lettered deliveries.
pub trait DeadLetterSink: Send + Sync {
    /// Park a failed delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the entry cannot be stored.
    /// The caller must not ack the delivery in that case.
    fn park(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>>;
}
