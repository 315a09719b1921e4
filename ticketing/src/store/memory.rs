//! In-memory [`TicketStore`].
//!
//! A unit of work takes the store-wide async lock, mutates a private copy of
//! the tables and swaps it in on commit. Dropping it discards the copy, which
//! is the rollback. Units of work are therefore fully serialized, which is
//! all the no-oversell guarantee needs here.
//!
//! The store is also the [`Outbox`] for its own committed messages, so the
//! relay can run against it unchanged.

use super::{BookingView, ClaimRequest, StoreError, TicketStore, UnitOfWork};
use crate::aggregates::booking::Booking;
use crate::types::{
    BookingId, BookingStatus, BuyerId, Event, EventId, Money, Page, TicketUnit, TicketUnitId, TypeAvailability,
    UnitStatus,
};
use async_trait::async_trait;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::BoxFuture;
use boxoffice_core::outbox::{Outbox, OutboxError, OutboxMessage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
struct Tables {
    events: HashMap<EventId, Event>,
    units: BTreeMap<TicketUnitId, TicketUnit>,
    bookings: HashMap<BookingId, Booking>,
    // Insertion order, oldest first.
    booking_order: Vec<BookingId>,
    outbox: Vec<(OutboxMessage, bool)>,
    next_outbox_id: i64,
    processed: HashSet<(String, String)>,
}

impl Tables {
    fn units_of(&self, booking_id: BookingId) -> Vec<TicketUnit> {
        self.units
            .values()
            .filter(|unit| unit.booking_id() == Some(booking_id))
            .cloned()
            .collect()
    }
}

/// Store kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryTicketStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryTicketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unit of an event, in id order.
    pub async fn units_of_event(&self, event_id: EventId) -> Vec<TicketUnit> {
        self.tables
            .lock()
            .await
            .units
            .values()
            .filter(|unit| unit.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Number of dedupe keys recorded for `consumer`.
    pub async fn processed_count(&self, consumer: &str) -> usize {
        self.tables
            .lock()
            .await
            .processed
            .iter()
            .filter(|(name, _)| name == consumer)
            .count()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<BookingView>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.bookings.get(&booking_id).map(|booking| BookingView {
            booking: booking.clone(),
            units: tables.units_of(booking_id),
        }))
    }

    async fn bookings_for_buyer(&self, buyer_id: BuyerId, page: Page) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.lock().await;
        let skip = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        Ok(tables
            .booking_order
            .iter()
            .rev()
            .filter_map(|id| tables.bookings.get(id))
            .filter(|booking| booking.buyer_id() == buyer_id)
            .skip(skip)
            .take(page.size() as usize)
            .cloned()
            .collect())
    }

    async fn availability(&self, event_id: EventId) -> Result<Vec<TypeAvailability>, StoreError> {
        let tables = self.tables.lock().await;
        let mut grouped: BTreeMap<(String, u64), u32> = BTreeMap::new();
        for unit in tables.units.values().filter(|unit| unit.event_id == event_id) {
            let count = grouped.entry((unit.ticket_type.clone(), unit.price.cents())).or_default();
            if unit.status() == UnitStatus::Available {
                *count += 1;
            }
        }
        Ok(grouped
            .into_iter()
            .map(|((ticket_type, cents), available)| TypeAvailability {
                ticket_type,
                price: Money::from_cents(cents),
                available,
            })
            .collect())
    }

    async fn is_processed(&self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.processed.contains(&(consumer.to_string(), dedupe_key.to_string())))
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn claim(&mut self, request: &ClaimRequest<'_>) -> Result<Vec<TicketUnit>, StoreError> {
        if request.quantity == 0 {
            return Err(StoreError::InvalidQuantity);
        }

        let candidates: Vec<TicketUnitId> = self
            .working
            .units
            .values()
            .filter(|unit| {
                unit.event_id == request.event_id
                    && unit.ticket_type == request.ticket_type
                    && unit.status() == UnitStatus::Available
            })
            .map(|unit| unit.id)
            .take(request.quantity as usize)
            .collect();

        if candidates.len() < request.quantity as usize {
            return Err(StoreError::InsufficientInventory {
                ticket_type: request.ticket_type.to_string(),
                requested: request.quantity,
                available: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
            });
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(unit) = self.working.units.get_mut(&id) {
                unit.assign(request.booking_id, request.buyer_id);
                claimed.push(unit.clone());
            }
        }
        Ok(claimed)
    }

    async fn release(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        let mut released = Vec::new();
        for unit in self.working.units.values_mut() {
            if unit.booking_id() == Some(booking_id) {
                unit.unassign();
                released.push(unit.clone());
            }
        }
        Ok(released)
    }

    async fn confirm(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        let owned = self.working.units_of(booking_id);
        if let Some(unit) = owned.iter().find(|unit| unit.status() != UnitStatus::Reserved) {
            return Err(StoreError::InvalidUnitState { unit_id: unit.id, status: unit.status() });
        }

        let mut confirmed = Vec::with_capacity(owned.len());
        for unit in owned {
            if let Some(stored) = self.working.units.get_mut(&unit.id) {
                stored.sell();
                confirmed.push(stored.clone());
            }
        }
        Ok(confirmed)
    }

    async fn units_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<TicketUnit>, StoreError> {
        Ok(self.working.units_of(booking_id))
    }

    async fn insert_event(&mut self, event: &Event, units: &[TicketUnit]) -> Result<(), StoreError> {
        if self.working.events.contains_key(&event.id) {
            return Err(StoreError::Conflict(format!("event {} already exists", event.id)));
        }
        self.working.events.insert(event.id, event.clone());
        for unit in units {
            self.working.units.insert(unit.id, unit.clone());
        }
        Ok(())
    }

    async fn load_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.working.events.get(&event_id).cloned())
    }

    async fn insert_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        if self.working.bookings.contains_key(&booking.id()) {
            return Err(StoreError::Conflict(format!("booking {} already exists", booking.id())));
        }
        self.working.bookings.insert(booking.id(), booking.clone());
        self.working.booking_order.push(booking.id());
        Ok(())
    }

    async fn lock_booking(&mut self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.working.bookings.get(&booking_id).cloned())
    }

    async fn lock_bookings_for_buyer(
        &mut self,
        buyer_id: BuyerId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, StoreError> {
        let tables = &self.working;
        Ok(tables
            .booking_order
            .iter()
            .filter_map(|id| tables.bookings.get(id))
            .filter(|booking| booking.buyer_id() == buyer_id && statuses.contains(&booking.status()))
            .cloned()
            .collect())
    }

    async fn save_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        match self.working.bookings.get_mut(&booking.id()) {
            Some(stored) => {
                *stored = booking.clone();
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!("booking {} vanished", booking.id()))),
        }
    }

    async fn enqueue(&mut self, topic: &str, routing_key: &str, event: &SerializedEvent) -> Result<(), StoreError> {
        self.working.next_outbox_id += 1;
        let message = OutboxMessage {
            id: self.working.next_outbox_id,
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            event: event.clone(),
        };
        self.working.outbox.push((message, false));
        Ok(())
    }

    async fn mark_processed(&mut self, consumer: &str, dedupe_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .working
            .processed
            .insert((consumer.to_string(), dedupe_key.to_string())))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

impl Outbox for InMemoryTicketStore {
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            Ok(self
                .tables
                .lock()
                .await
                .outbox
                .iter()
                .filter(|(_, published)| !published)
                .take(limit)
                .map(|(message, _)| message.clone())
                .collect())
        })
    }

    fn mark_published(&self, ids: &[i64]) -> BoxFuture<'_, Result<(), OutboxError>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            for (message, published) in &mut tables.outbox {
                if ids.contains(&message.id) {
                    *published = true;
                }
            }
            Ok(())
        })
    }
}
