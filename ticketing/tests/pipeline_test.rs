//! End-to-end flow through the wired application: service → outbox →
//! relay → bus → sagas, on the in-memory store and bus.
//!
//! Run with: `cargo test --test pipeline_test`

#![allow(clippy::expect_used)]

mod common;

use async_trait::async_trait;
use boxoffice_core::event_bus::EventBus;
use boxoffice_testing::{InMemoryDeadLetters, InMemoryEventBus, eventually, init_tracing};
use common::{Fixture, envelope, payment_for};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use ticketing::Config;
use ticketing::events::{EventPayload, topics};
use ticketing::runtime::{Application, Infrastructure, RunningApplication};
use ticketing::sagas::notification::NotificationError;
use ticketing::sagas::{AccountSaga, Notification, NotificationSaga, NotificationSender, PaymentSaga};
use ticketing::types::{BookingId, BookingStatus, BuyerId, LineItem};

#[derive(Default)]
struct CountingSender {
    sent: AtomicUsize,
}

#[async_trait]
impl NotificationSender for CountingSender {
    async fn send(&self, _notification: &Notification) -> Result<(), NotificationError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    fixture: Fixture,
    bus: InMemoryEventBus,
    dead_letters: InMemoryDeadLetters,
    notifications: Arc<CountingSender>,
    app: RunningApplication,
}

async fn start(max_retries: usize) -> Harness {
    init_tracing();
    let fixture = Fixture::stocked(0, 4).await;
    let bus = InMemoryEventBus::new();
    let dead_letters = InMemoryDeadLetters::new();
    let notifications = Arc::new(CountingSender::default());

    for subscription in [PaymentSaga::subscription(), AccountSaga::subscription(), NotificationSaga::subscription()] {
        bus.declare(&subscription);
    }

    let mut config = Config::from_env();
    config.consumer.max_retries = max_retries;
    config.consumer.initial_backoff = Duration::from_millis(5);
    config.consumer.max_backoff = Duration::from_millis(20);
    config.consumer.drain_timeout = Duration::from_secs(1);
    config.outbox.poll_interval = Duration::from_millis(20);

    let infrastructure = Infrastructure {
        store: fixture.store(),
        outbox: Arc::new(fixture.store.clone()),
        event_bus: Arc::new(bus.clone()),
        dead_letters: Arc::new(dead_letters.clone()),
        clock: fixture.clock(),
        notifications: Arc::clone(&notifications) as Arc<dyn NotificationSender>,
    };
    let app = Application::assemble(infrastructure, &config).expect("application wires").start();

    Harness { fixture, bus, dead_letters, notifications, app }
}

#[tokio::test]
async fn booking_is_published_and_confirmed_by_payment() {
    let h = start(3).await;
    let buyer_id = BuyerId::new();

    let booking = h
        .app
        .service()
        .create_booking(buyer_id, h.fixture.event.id, &[LineItem::new("GA", 2)])
        .await
        .expect("booking created");

    assert!(eventually(Duration::from_secs(2), || h.bus.published_types().contains(&"booking.created".to_string())).await);
    assert!(eventually(Duration::from_secs(2), || h.notifications.sent.load(Ordering::SeqCst) == 1).await);

    h.bus
        .publish(
            topics::PAYMENT_EVENTS,
            "payment.completed",
            &envelope(&EventPayload::PaymentCompleted(payment_for(&booking))),
        )
        .await
        .expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.bus.acked(ticketing::sagas::payment::CONSUMER) == 1).await);
    assert!(eventually(Duration::from_secs(2), || h.bus.published_types().contains(&"booking.updated".to_string())).await);

    let view = h.app.service().get_booking(booking.id()).await.expect("exists");
    assert_eq!(view.booking.status(), BookingStatus::Confirmed);

    let relayed = h.bus.published();
    let created = relayed.iter().find(|p| p.routing_key == "booking.created").expect("relayed");
    assert_eq!(created.topic, topics::TICKET_EVENTS);
    assert!(h.dead_letters.letters().is_empty());

    h.app.shutdown().await;
}

#[tokio::test]
async fn payment_overtaking_its_booking_is_applied_once_the_booking_exists() {
    let h = start(50).await;
    let buyer_id = BuyerId::new();
    let booking_id = BookingId::new();

    let placeholder = h.fixture.unsaved_booking(booking_id, buyer_id);
    h.bus
        .publish(
            topics::PAYMENT_EVENTS,
            "payment.completed",
            &envelope(&EventPayload::PaymentCompleted(payment_for(&placeholder))),
        )
        .await
        .expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.bus.requeued(ticketing::sagas::payment::CONSUMER) >= 1).await);
    h.fixture.insert_pending(booking_id, buyer_id, 1).await;

    assert!(eventually(Duration::from_secs(3), || h.bus.acked(ticketing::sagas::payment::CONSUMER) == 1).await);
    let view = h.app.service().get_booking(booking_id).await.expect("exists");
    assert_eq!(view.booking.status(), BookingStatus::Confirmed);
    assert!(h.dead_letters.letters().is_empty());

    h.app.shutdown().await;
}

#[tokio::test]
async fn payment_for_a_booking_that_never_appears_is_dead_lettered() {
    let h = start(2).await;
    let placeholder = h.fixture.unsaved_booking(BookingId::new(), BuyerId::new());

    let completed = envelope(&EventPayload::PaymentCompleted(payment_for(&placeholder)));
    h.bus.publish(topics::PAYMENT_EVENTS, "payment.completed", &completed).await.expect("publish");

    assert!(eventually(Duration::from_secs(3), || h.dead_letters.letters().len() == 1).await);
    let letter = &h.dead_letters.letters()[0];
    assert_eq!(letter.queue, ticketing::sagas::payment::CONSUMER);
    assert_eq!(letter.attempts, 3);
    assert_eq!(letter.event.dedupe_key, completed.dedupe_key);

    h.app.shutdown().await;
}
