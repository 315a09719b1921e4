//! Record payload written to the topic.
//!
//! Kafka has no broker-side redelivery counter, so the attempt number
//! travels with the record. A requeue republishes the same envelope with
//! `attempt + 1`, addressed to the queue that nacked it: every other
//! consumer group on the topic settles the copy unseen.

use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::EventBusError;
use serde::{Deserialize, Serialize};

/// One record on a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Routing key the record was published with
    pub routing_key: String,
    /// Delivery attempt this record represents, starting at 1
    pub attempt: u32,
    /// Queue a requeued copy is meant for; `None` for a first publish
    pub requeued_for: Option<String>,
    /// The envelope
    pub event: SerializedEvent,
}

impl WireRecord {
    /// First delivery of `event`.
    #[must_use]
    pub fn first(routing_key: &str, event: SerializedEvent) -> Self {
        Self { routing_key: routing_key.to_string(), attempt: 1, requeued_for: None, event }
    }

    /// The same record, one attempt later, for `queue` only.
    #[must_use]
    pub fn retried_for(&self, queue: &str) -> Self {
        Self {
            routing_key: self.routing_key.clone(),
            attempt: self.attempt.saturating_add(1),
            requeued_for: Some(queue.to_string()),
            event: self.event.clone(),
        }
    }

    /// Whether `queue` should see this record at all.
    #[must_use]
    pub fn is_for(&self, queue: &str) -> bool {
        self.requeued_for.as_deref().is_none_or(|target| target == queue)
    }

    /// Encode with bincode.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if encoding fails.
    pub fn encode(&self, topic: &str) -> Result<Vec<u8>, EventBusError> {
        bincode::serialize(self).map_err(|e| EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: format!("Failed to serialize record: {e}"),
        })
    }

    /// Decode a record payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DeserializationFailed`] for foreign or
    /// corrupt payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, EventBusError> {
        bincode::deserialize(payload)
            .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to deserialize record: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> WireRecord {
        WireRecord::first(
            "payment.failed",
            SerializedEvent {
                event_id: Uuid::new_v4(),
                event_type: "payment.failed".to_string(),
                dedupe_key: "pay-1:payment.failed".to_string(),
                schema_version: 1,
                occurred_at: Utc::now(),
                causation_id: None,
                data: vec![7; 16],
            },
        )
    }

    #[test]
    fn retried_record_keeps_envelope_and_bumps_attempt() {
        let first = record();
        let second = first.retried_for("booking-payments");

        assert_eq!(second.attempt, 2);
        assert_eq!(second.event, first.event);
        assert_eq!(second.routing_key, "payment.failed");
        assert_eq!(second.retried_for("booking-payments").attempt, 3);

        let decoded = WireRecord::decode(&second.encode("payment_events").expect("encode")).expect("decode");
        assert_eq!(decoded, second);
    }

    #[test]
    fn requeued_copy_only_reaches_the_queue_that_nacked() {
        let first = record();
        assert!(first.is_for("booking-payments"));
        assert!(first.is_for("notifications"));

        let retried = first.retried_for("booking-payments");
        assert!(retried.is_for("booking-payments"));
        assert!(!retried.is_for("notifications"));
    }

    #[test]
    fn foreign_payload_is_rejected() {
        assert!(matches!(
            WireRecord::decode(b"{\"json\":true}"),
            Err(EventBusError::DeserializationFailed(_))
        ));
    }
}
