//! Runs the booking reducer and executes its effects in a unit of work.
//!
//! Shared by the reservation service and the saga handlers so that every
//! status change, whoever triggers it, goes through the same table and
//! touches units and the outbox the same way.

use crate::aggregates::booking::{Booking, BookingAction, BookingEffect, BookingEnvironment, BookingReducer, Outcome};
use crate::error::ReservationError;
use crate::publisher::EventPublisher;
use crate::store::UnitOfWork;
use boxoffice_core::environment::Clock;
use boxoffice_core::reducer::Reducer;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Applies [`BookingAction`]s to locked bookings.
#[derive(Clone)]
pub struct BookingTransitions {
    reducer: BookingReducer,
    env: BookingEnvironment,
    publisher: EventPublisher,
}

impl BookingTransitions {
    /// Creates a new `BookingTransitions`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            reducer: BookingReducer::new(),
            env: BookingEnvironment::new(Arc::clone(&clock)),
            publisher: EventPublisher::new(clock),
        }
    }

    /// The publisher used for follow-up events.
    #[must_use]
    pub const fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Offer `action` to `booking`, which the caller must have locked in
    /// `uow`. On an applied edge the units are confirmed or released, the
    /// booking is saved and its events are staged.
    ///
    /// An off-table action changes nothing and returns
    /// [`Outcome::Ignored`].
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TransientInfrastructure`] if the store
    /// rejects an effect. The unit of work must then be dropped.
    pub async fn apply(
        &self,
        uow: &mut dyn UnitOfWork,
        booking: &mut Booking,
        action: BookingAction,
        causation_id: Option<Uuid>,
    ) -> Result<Outcome, ReservationError> {
        let outcome = booking.outcome(&action);
        let Outcome::Applied { from, to } = outcome else {
            debug!(
                booking_id = %booking.id(),
                status = %booking.status(),
                ?action,
                "Transition not on the table, ignoring"
            );
            return Ok(outcome);
        };

        let effects = self.reducer.reduce(booking, action, &self.env);
        for effect in effects {
            match effect {
                BookingEffect::ConfirmUnits => {
                    uow.confirm(booking.id()).await?;
                }
                BookingEffect::ReleaseUnits => {
                    uow.release(booking.id()).await?;
                }
                BookingEffect::Publish(payload) => {
                    self.publisher.stage(uow, &payload, causation_id).await?;
                }
            }
        }
        uow.save_booking(booking).await?;

        info!(booking_id = %booking.id(), %from, %to, version = booking.version(), "Booking transitioned");
        metrics::counter!("booking_transitions_total", "to" => to.as_str()).increment(1);
        Ok(outcome)
    }
}
