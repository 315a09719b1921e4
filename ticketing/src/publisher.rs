//! Wraps domain facts in envelopes and stages them in the outbox.
//!
//! Nothing here talks to the broker. Staged envelopes become visible when
//! the unit of work commits and are then published by the
//! [`OutboxRelay`](boxoffice_runtime::OutboxRelay).

use crate::error::ReservationError;
use crate::events::EventPayload;
use crate::store::UnitOfWork;
use boxoffice_core::environment::Clock;
use boxoffice_core::event::{Event, SerializedEvent};
use std::sync::Arc;
use uuid::Uuid;

/// Stages [`EventPayload`]s in a unit of work's outbox.
#[derive(Clone)]
pub struct EventPublisher {
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Creates a new `EventPublisher`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Envelope `payload` and enqueue it on its topic, keyed by its event
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TransientInfrastructure`] if the payload
    /// cannot be encoded or the outbox insert fails.
    pub async fn stage(
        &self,
        uow: &mut dyn UnitOfWork,
        payload: &EventPayload,
        causation_id: Option<Uuid>,
    ) -> Result<SerializedEvent, ReservationError> {
        let mut envelope = SerializedEvent::from_event(payload, self.clock.now())?;
        if let Some(cause) = causation_id {
            envelope = envelope.caused_by(cause);
        }

        uow.enqueue(payload.topic(), payload.event_type(), &envelope).await?;
        tracing::debug!(
            event_type = %envelope.event_type,
            dedupe_key = %envelope.dedupe_key,
            "Event staged in outbox"
        );
        Ok(envelope)
    }
}
