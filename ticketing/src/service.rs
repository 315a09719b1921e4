//! Reservation service: the synchronous entry points.
//!
//! Each mutating call is one unit of work. Inventory claims, the booking row
//! and the outbox entries commit together or not at all, so a failed
//! `create_booking` leaves no claimed unit behind and no event escapes for a
//! booking that was never stored.

use crate::aggregates::booking::{Booking, BookingAction, Outcome, Requester};
use crate::error::ReservationError;
use crate::store::{BookingView, ClaimRequest, TicketStore, UnitOfWork};
use crate::transition::BookingTransitions;
use crate::types::{
    BookingId, BookingStatus, BuyerId, Event, EventId, LineItem, Money, Page, TicketTypeStock, TicketUnit,
    TypeAvailability,
};
use boxoffice_core::environment::Clock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Reservation service.
#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    transitions: BookingTransitions,
    relay_waker: Option<Arc<Notify>>,
}

impl ReservationService {
    /// Creates a new `ReservationService`
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transitions: BookingTransitions::new(Arc::clone(&clock)),
            clock,
            relay_waker: None,
        }
    }

    /// Wake the outbox relay after every commit that staged events.
    #[must_use]
    pub fn with_relay_waker(mut self, waker: Arc<Notify>) -> Self {
        self.relay_waker = Some(waker);
        self
    }

    fn wake_relay(&self) {
        if let Some(waker) = &self.relay_waker {
            waker.notify_one();
        }
    }

    /// Put an event on sale with the given units.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidQuantity`] if a type has zero units
    /// - [`ReservationError::TransientInfrastructure`] if the store fails
    #[tracing::instrument(skip(self, event, stock), fields(event_id = %event.id))]
    pub async fn stock_event(&self, event: Event, stock: &[TicketTypeStock]) -> Result<Event, ReservationError> {
        if stock.iter().any(|line| line.quantity == 0) {
            return Err(ReservationError::InvalidQuantity);
        }

        let units: Vec<TicketUnit> = stock
            .iter()
            .flat_map(|line| {
                (0..line.quantity).map(|_| TicketUnit::available(event.id, line.ticket_type.clone(), line.price))
            })
            .collect();

        let mut uow = self.store.begin().await?;
        uow.insert_event(&event, &units).await?;
        uow.commit().await?;

        info!(units = units.len(), name = %event.name, "Event stocked");
        Ok(event)
    }

    /// Claim units for every line item and store a pending booking.
    ///
    /// Duplicate ticket types are merged. All claims share one unit of
    /// work, so the first failure rolls back the earlier ones.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidQuantity`] for no line items or a zero
    ///   quantity
    /// - [`ReservationError::EventNotFound`] /
    ///   [`ReservationError::EventNotSellable`]
    /// - [`ReservationError::InsufficientInventory`] for the first type
    ///   that cannot be filled
    /// - [`ReservationError::PriceOverflow`]
    /// - [`ReservationError::TransientInfrastructure`] if the store fails
    #[tracing::instrument(skip(self, line_items))]
    pub async fn create_booking(
        &self,
        buyer_id: BuyerId,
        event_id: EventId,
        line_items: &[LineItem],
    ) -> Result<Booking, ReservationError> {
        let started = Instant::now();
        let result = self.try_create_booking(buyer_id, event_id, line_items).await;
        metrics::histogram!("booking_create_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                info!(booking_id = %booking.id(), total = %booking.total_price(), "Booking created");
                metrics::counter!("bookings_created_total").increment(1);
                self.wake_relay();
            }
            Err(error) => {
                debug!(%error, "Booking rejected");
                metrics::counter!("bookings_rejected_total", "reason" => error.reason()).increment(1);
            }
        }
        result
    }

    async fn try_create_booking(
        &self,
        buyer_id: BuyerId,
        event_id: EventId,
        line_items: &[LineItem],
    ) -> Result<Booking, ReservationError> {
        let wanted = merge_line_items(line_items)?;

        let mut uow = self.store.begin().await?;
        let event = uow.load_event(event_id).await?.ok_or(ReservationError::EventNotFound)?;
        let now = self.clock.now();
        if let Some(reason) = event.unsellable_reason(now) {
            return Err(ReservationError::EventNotSellable(reason.to_string()));
        }

        let booking_id = BookingId::new();
        let mut claimed = Vec::new();
        for (&ticket_type, &quantity) in &wanted {
            let units = uow
                .claim(&ClaimRequest { event_id, ticket_type, quantity, booking_id, buyer_id })
                .await?;
            claimed.extend(units);
        }

        let total = Money::checked_sum(claimed.iter().map(|unit| unit.price)).ok_or(ReservationError::PriceOverflow)?;
        let booking = Booking::pending(booking_id, buyer_id, event_id, total, now);

        uow.insert_booking(&booking).await?;
        self.transitions
            .publisher()
            .stage(uow.as_mut(), &booking.created_event(), None)
            .await?;
        uow.commit().await?;

        Ok(booking)
    }

    /// Admin status change along the transition table.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::BookingNotFound`]
    /// - [`ReservationError::InvalidTransition`] if the table has no such
    ///   edge
    /// - [`ReservationError::TransientInfrastructure`] if the store fails
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, booking_id: BookingId, target: BookingStatus) -> Result<Booking, ReservationError> {
        let action = BookingAction::SetStatus { target, requested_by: Requester::Admin };
        let (booking, outcome) = self.transition(booking_id, None, action).await?;

        match outcome {
            Outcome::Applied { .. } => Ok(booking),
            Outcome::Ignored => {
                warn!(from = %booking.status(), to = %target, "Rejected status change");
                Err(ReservationError::InvalidTransition { from: booking.status(), to: target })
            }
        }
    }

    /// The buyer cancels their own booking.
    ///
    /// Cancelling a booking that is already past the point where the buyer
    /// may cancel returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::BookingNotFound`] if it does not exist or
    ///   belongs to someone else
    /// - [`ReservationError::TransientInfrastructure`] if the store fails
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        buyer_id: BuyerId,
        reason: &str,
    ) -> Result<Booking, ReservationError> {
        let action = BookingAction::Cancel { requested_by: Requester::Buyer, reason: reason.to_string() };
        let (booking, _) = self.transition(booking_id, Some(buyer_id), action).await?;
        Ok(booking)
    }

    async fn transition(
        &self,
        booking_id: BookingId,
        owner: Option<BuyerId>,
        action: BookingAction,
    ) -> Result<(Booking, Outcome), ReservationError> {
        let mut uow = self.store.begin().await?;
        let mut booking = uow
            .lock_booking(booking_id)
            .await?
            .filter(|booking| owner.is_none_or(|buyer| booking.buyer_id() == buyer))
            .ok_or(ReservationError::BookingNotFound)?;

        let outcome = self.transitions.apply(uow.as_mut(), &mut booking, action, None).await?;
        if outcome == Outcome::Ignored {
            return Ok((booking, outcome));
        }

        uow.commit().await?;
        self.wake_relay();
        Ok((booking, outcome))
    }

    /// A booking with its current units.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::BookingNotFound`]
    /// - [`ReservationError::TransientInfrastructure`] if the store fails
    pub async fn get_booking(&self, booking_id: BookingId) -> Result<BookingView, ReservationError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or(ReservationError::BookingNotFound)
    }

    /// A buyer's bookings, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TransientInfrastructure`] if the store
    /// fails.
    pub async fn bookings_for_buyer(&self, buyer_id: BuyerId, page: Page) -> Result<Vec<Booking>, ReservationError> {
        Ok(self.store.bookings_for_buyer(buyer_id, page).await?)
    }

    /// Available units per type and price.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TransientInfrastructure`] if the store
    /// fails.
    pub async fn availability(&self, event_id: EventId) -> Result<Vec<TypeAvailability>, ReservationError> {
        Ok(self.store.availability(event_id).await?)
    }
}

/// Reject empty or zero-quantity requests and merge repeated types.
fn merge_line_items(line_items: &[LineItem]) -> Result<BTreeMap<&str, u32>, ReservationError> {
    if line_items.is_empty() {
        return Err(ReservationError::InvalidQuantity);
    }

    let mut merged = BTreeMap::new();
    for item in line_items {
        if item.quantity == 0 {
            return Err(ReservationError::InvalidQuantity);
        }
        let quantity: &mut u32 = merged.entry(item.ticket_type.as_str()).or_default();
        *quantity = quantity.checked_add(item.quantity).ok_or(ReservationError::InvalidQuantity)?;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_items_are_validated_and_merged() {
        assert_eq!(merge_line_items(&[]), Err(ReservationError::InvalidQuantity));
        assert_eq!(
            merge_line_items(&[LineItem::new("VIP", 1), LineItem::new("GA", 0)]),
            Err(ReservationError::InvalidQuantity)
        );

        let items = [LineItem::new("VIP", 1), LineItem::new("GA", 2), LineItem::new("VIP", 2)];
        let merged = merge_line_items(&items);
        assert_eq!(merged, Ok(BTreeMap::from([("GA", 2), ("VIP", 3)])));
    }
}
