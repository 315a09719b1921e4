//! Domain event envelope.
//!
//! Every fact that leaves a service travels as a [`SerializedEvent`]: a small
//! envelope carrying routing and idempotency metadata around a `bincode`
//! payload. The payload type is owned by the application and implements
//! [`Event`].
//!
//! # Design
//!
//! Payloads are serialized with `bincode`. Payload enums must use serde's
//! default (external) tagging; internally tagged enums cannot be decoded by
//! `bincode`.
//!
//! # Example
//!
//! ```
//! use boxoffice_core::event::{Event, SerializedEvent};
//! use chrono::Utc;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! enum OrderEvent {
//!     OrderPlaced { order_id: String, total_cents: u64 },
//! }
//!
//! impl Event for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::OrderPlaced { .. } => "order.placed",
//!         }
//!     }
//!
//!     fn dedupe_key(&self) -> String {
//!         match self {
//!             OrderEvent::OrderPlaced { order_id, .. } => format!("{order_id}:order.placed"),
//!         }
//!     }
//! }
//!
//! let event = OrderEvent::OrderPlaced { order_id: "o-1".into(), total_cents: 500 };
//! let envelope = SerializedEvent::from_event(&event, Utc::now()).unwrap();
//! assert_eq!(envelope.event_type, "order.placed");
//! assert_eq!(envelope.decode::<OrderEvent>().unwrap(), event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Envelope schema version written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// Errors that can occur during event serialization/deserialization.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope was written with a schema this build does not read
    #[error("Unsupported schema version {found} for {event_type}")]
    UnsupportedSchema {
        /// Event type of the rejected envelope
        event_type: String,
        /// Version found on the wire
        found: u16,
    },
}

/// A domain fact that can be put on the wire.
///
/// Implementors are usually closed enums with one variant per event type,
/// so consumers can match exhaustively instead of probing loose maps.
pub trait Event: Send + Sync + 'static {
    /// Namespaced event type, also used as the routing key
    /// (e.g. `booking.created`).
    fn event_type(&self) -> &'static str;

    /// Stable key identifying this fact for idempotent consumers.
    ///
    /// Redelivering an event with the same key must not cause a second state
    /// change downstream.
    fn dedupe_key(&self) -> String;

    /// Serialize this event to bytes using bincode.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if serialization fails.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bytes using bincode.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes do not hold
    /// a valid event.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Serialized event envelope, ready for the outbox or the event bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Unique id of this envelope
    pub event_id: Uuid,

    /// Namespaced event type (e.g. `payment.completed`)
    pub event_type: String,

    /// Idempotency key, see [`Event::dedupe_key`]
    pub dedupe_key: String,

    /// Envelope schema version
    pub schema_version: u16,

    /// When the fact happened
    pub occurred_at: DateTime<Utc>,

    /// Envelope id of the event that caused this one, if any
    pub causation_id: Option<Uuid>,

    /// Bincode-encoded payload
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Wrap a typed event into a new envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be
    /// encoded.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            dedupe_key: event.dedupe_key(),
            schema_version: SCHEMA_VERSION,
            occurred_at,
            causation_id: None,
            data: event.to_bytes()?,
        })
    }

    /// Record the envelope that caused this event.
    #[must_use]
    pub const fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Decode the payload into its typed form.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnsupportedSchema`] for envelopes written by a
    /// newer schema, or [`EventError::DeserializationError`] if the payload
    /// does not decode.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(EventError::UnsupportedSchema {
                event_type: self.event_type.clone(),
                found: self.schema_version,
            });
        }
        E::from_bytes(&self.data)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.dedupe_key,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Created { id: String, value: i32 },
        Updated { id: String, new_value: i32 },
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "test.created",
                TestEvent::Updated { .. } => "test.updated",
            }
        }

        fn dedupe_key(&self) -> String {
            match self {
                TestEvent::Created { id, .. } | TestEvent::Updated { id, .. } => {
                    format!("{id}:{}", self.event_type())
                }
            }
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn envelope_carries_type_and_dedupe_key() {
        let event = TestEvent::Updated {
            id: "test-1".to_string(),
            new_value: 100,
        };

        let serialized =
            SerializedEvent::from_event(&event, Utc::now()).expect("serialization should succeed");

        assert_eq!(serialized.event_type, "test.updated");
        assert_eq!(serialized.dedupe_key, "test-1:test.updated");
        assert_eq!(serialized.schema_version, SCHEMA_VERSION);
        assert!(serialized.causation_id.is_none());
        assert_eq!(
            serialized.decode::<TestEvent>().expect("decode should succeed"),
            event
        );
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn newer_schema_is_rejected() {
        let event = TestEvent::Created {
            id: "test-1".to_string(),
            value: 1,
        };
        let mut serialized =
            SerializedEvent::from_event(&event, Utc::now()).expect("serialization should succeed");
        serialized.schema_version = SCHEMA_VERSION + 1;

        assert!(matches!(
            serialized.decode::<TestEvent>(),
            Err(EventError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn envelope_survives_bincode() {
        let event = TestEvent::Created {
            id: "test-2".to_string(),
            value: 7,
        };
        let envelope = SerializedEvent::from_event(&event, Utc::now())
            .expect("serialization should succeed")
            .caused_by(Uuid::new_v4());

        let bytes = bincode::serialize(&envelope).expect("envelope should encode");
        let back: SerializedEvent = bincode::deserialize(&bytes).expect("envelope should decode");
        assert_eq!(back, envelope);
    }

    #[test]
    fn garbage_payload_fails_to_decode() {
        let envelope = SerializedEvent {
            event_id: Uuid::new_v4(),
            event_type: "test.created".to_string(),
            dedupe_key: "x".to_string(),
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            causation_id: None,
            data: vec![0xff, 0xff, 0xff, 0xff, 0xff],
        };
        assert!(matches!(
            envelope.decode::<TestEvent>(),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn serialized_event_display() {
        let serialized = SerializedEvent {
            event_id: Uuid::new_v4(),
            event_type: "test.created".to_string(),
            dedupe_key: "k".to_string(),
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            causation_id: None,
            data: vec![1, 2, 3, 4, 5],
        };

        let display = format!("{serialized}");
        assert!(display.contains("test.created"));
        assert!(display.contains("5 bytes"));
    }
}
