//! Shared fixtures for the ticketing integration tests.

#![allow(dead_code)]
#![allow(clippy::expect_used)]

use boxoffice_core::environment::Clock;
use boxoffice_core::event::SerializedEvent;
use boxoffice_testing::{FixedClock, test_clock};
use chrono::Duration;
use std::sync::Arc;
use ticketing::aggregates::booking::Booking;
use ticketing::events::{EventPayload, PaymentDetails};
use ticketing::store::{ClaimRequest, InMemoryTicketStore, TicketStore};
use ticketing::types::{BookingId, BuyerId, Event, LineItem, Money, PaymentId, TicketTypeStock};
use ticketing::ReservationService;

/// VIP at 150.00, GA at 50.00.
pub const VIP_PRICE: Money = Money::from_cents(15_000);
pub const GA_PRICE: Money = Money::from_cents(5_000);

pub struct Fixture {
    pub store: InMemoryTicketStore,
    pub clock: Arc<FixedClock>,
    pub service: ReservationService,
    pub event: Event,
}

impl Fixture {
    /// A store with one event a week out stocked with `vip` VIP and `ga` GA
    /// units.
    pub async fn stocked(vip: u32, ga: u32) -> Self {
        let store = InMemoryTicketStore::new();
        let clock = Arc::new(test_clock());
        let service = ReservationService::new(Arc::new(store.clone()), Arc::clone(&clock) as Arc<dyn Clock>);

        let now = clock.now();
        let mut stock = Vec::new();
        if vip > 0 {
            stock.push(TicketTypeStock { ticket_type: "VIP".to_string(), price: VIP_PRICE, quantity: vip });
        }
        if ga > 0 {
            stock.push(TicketTypeStock { ticket_type: "GA".to_string(), price: GA_PRICE, quantity: ga });
        }
        let event = service
            .stock_event(Event::new("Night Show", "Arena", now + Duration::days(7), now), &stock)
            .await
            .expect("event stocks");

        Self { store, clock, service, event }
    }

    pub fn store(&self) -> Arc<dyn TicketStore> {
        Arc::new(self.store.clone())
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock) as Arc<dyn Clock>
    }

    pub async fn book(&self, buyer_id: BuyerId, items: &[(&str, u32)]) -> Booking {
        let items: Vec<_> = items.iter().map(|&(ticket_type, quantity)| LineItem::new(ticket_type, quantity)).collect();
        self.service
            .create_booking(buyer_id, self.event.id, &items)
            .await
            .expect("booking is created")
    }

    /// A pending booking that is never stored.
    pub fn unsaved_booking(&self, booking_id: BookingId, buyer_id: BuyerId) -> Booking {
        Booking::pending(booking_id, buyer_id, self.event.id, GA_PRICE, self.clock.now())
    }

    /// Store a pending booking with a chosen id, claiming `quantity` GA
    /// units, without going through the service.
    pub async fn insert_pending(&self, booking_id: BookingId, buyer_id: BuyerId, quantity: u32) -> Booking {
        let mut uow = self.store.begin().await.expect("begin");
        let units = uow
            .claim(&ClaimRequest { event_id: self.event.id, ticket_type: "GA", quantity, booking_id, buyer_id })
            .await
            .expect("claim");
        let total = Money::checked_sum(units.iter().map(|unit| unit.price)).expect("no overflow");
        let booking = Booking::pending(booking_id, buyer_id, self.event.id, total, self.clock.now());
        uow.insert_booking(&booking).await.expect("insert");
        uow.commit().await.expect("commit");
        booking
    }
}

pub fn payment_for(booking: &Booking) -> PaymentDetails {
    PaymentDetails {
        payment_id: PaymentId::new(),
        booking_id: booking.id(),
        buyer_id: booking.buyer_id(),
        amount: booking.total_price(),
        currency: "USD".to_string(),
    }
}

pub fn envelope(payload: &EventPayload) -> SerializedEvent {
    SerializedEvent::from_event(payload, test_clock().now()).expect("payload encodes")
}
