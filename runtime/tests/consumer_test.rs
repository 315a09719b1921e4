//! Consumer settlement tests against the in-memory bus.

#![allow(clippy::expect_used)]

use async_trait::async_trait;
use boxoffice_core::event::{Event, SerializedEvent};
use boxoffice_core::event_bus::{EventBus, Subscription};
use boxoffice_runtime::retry::RetryPolicy;
use boxoffice_runtime::{EventConsumer, HandlerError, MessageHandler};
use boxoffice_testing::{InMemoryDeadLetters, InMemoryEventBus, eventually, init_tracing};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    id: u32,
}

impl Event for Ping {
    fn event_type(&self) -> &'static str {
        "ping.sent"
    }

    fn dedupe_key(&self) -> String {
        format!("{}:ping.sent", self.id)
    }
}

fn ping(id: u32) -> SerializedEvent {
    SerializedEvent::from_event(&Ping { id }, Utc::now()).expect("ping encodes")
}

/// Fails the first `failures` calls with the given error, then succeeds.
struct Flaky {
    failures: usize,
    error: HandlerError,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Flaky {
    async fn handle(&self, _event: &SerializedEvent) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures { Err(self.error.clone()) } else { Ok(()) }
    }
}

struct Harness {
    bus: InMemoryEventBus,
    dead_letters: InMemoryDeadLetters,
    shutdown: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

fn start(handler: Arc<dyn MessageHandler>, max_retries: usize, prefetch: usize) -> Harness {
    init_tracing();
    let bus = InMemoryEventBus::new();
    let dead_letters = InMemoryDeadLetters::new();
    let (shutdown, _) = broadcast::channel(1);

    let subscription = Subscription::new("pings").bind("test_events", "ping.*");
    bus.declare(&subscription);

    let handle = EventConsumer::builder()
        .subscription(subscription)
        .event_bus(Arc::new(bus.clone()))
        .handler(handler)
        .dead_letters(Arc::new(dead_letters.clone()))
        .shutdown(shutdown.subscribe())
        .retry_policy(
            RetryPolicy::builder()
                .max_retries(max_retries)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        )
        .prefetch(prefetch)
        .reconnect_delay(Duration::from_millis(10))
        .build()
        .expect("consumer config is complete")
        .spawn();

    Harness { bus, dead_letters, shutdown, handle }
}

#[tokio::test]
async fn successful_delivery_is_acked() {
    let handler = Arc::new(Flaky { failures: 0, error: HandlerError::Retry(String::new()), calls: AtomicUsize::new(0) });
    let h = start(handler, 3, 4);

    h.bus.publish("test_events", "ping.sent", &ping(1)).await.expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.bus.acked("pings") == 1).await);
    assert_eq!(h.bus.requeued("pings"), 0);
    assert!(h.dead_letters.letters().is_empty());

    h.shutdown.send(()).expect("consumer listening");
    tokio::time::timeout(Duration::from_secs(2), h.handle).await.expect("consumer stops").expect("no panic");
}

#[tokio::test]
async fn transient_failures_are_requeued_then_succeed() {
    let handler = Arc::new(Flaky {
        failures: 2,
        error: HandlerError::Retry("database unavailable".into()),
        calls: AtomicUsize::new(0),
    });
    let h = start(Arc::clone(&handler) as Arc<dyn MessageHandler>, 3, 4);

    h.bus.publish("test_events", "ping.sent", &ping(2)).await.expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.bus.acked("pings") == 1).await);
    assert_eq!(h.bus.requeued("pings"), 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(h.dead_letters.letters().is_empty());
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let handler = Arc::new(Flaky {
        failures: usize::MAX,
        error: HandlerError::Retry("booking not found".into()),
        calls: AtomicUsize::new(0),
    });
    let h = start(handler, 2, 4);

    h.bus.publish("test_events", "ping.sent", &ping(3)).await.expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.dead_letters.letters().len() == 1).await);
    let letter = &h.dead_letters.letters()[0];
    assert_eq!(letter.queue, "pings");
    assert_eq!(letter.attempts, 3);
    assert_eq!(letter.error, "booking not found");
    assert_eq!(letter.event.dedupe_key, "3:ping.sent");

    assert!(eventually(Duration::from_secs(2), || h.bus.acked("pings") == 1).await);
    assert_eq!(h.bus.requeued("pings"), 2);
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let handler = Arc::new(Flaky {
        failures: usize::MAX,
        error: HandlerError::DeadLetter("undecodable payload".into()),
        calls: AtomicUsize::new(0),
    });
    let h = start(Arc::clone(&handler) as Arc<dyn MessageHandler>, 5, 4);

    h.bus.publish("test_events", "ping.sent", &ping(4)).await.expect("publish");

    assert!(eventually(Duration::from_secs(2), || h.dead_letters.letters().len() == 1).await);
    assert_eq!(h.dead_letters.letters()[0].attempts, 1);
    assert_eq!(h.bus.requeued("pings"), 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

/// Tracks the highest number of concurrent calls.
struct Slow {
    active: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Slow {
    async fn handle(&self, _event: &SerializedEvent) -> Result<(), HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn prefetch_bounds_in_flight_handlers() {
    let handler = Arc::new(Slow { active: AtomicUsize::new(0), peak: AtomicUsize::new(0), done: AtomicUsize::new(0) });
    let h = start(Arc::clone(&handler) as Arc<dyn MessageHandler>, 3, 2);

    for id in 0..6 {
        h.bus.publish("test_events", "ping.sent", &ping(id)).await.expect("publish");
    }

    assert!(eventually(Duration::from_secs(3), || handler.done.load(Ordering::SeqCst) == 6).await);
    assert!(handler.peak.load(Ordering::SeqCst) <= 2);
    assert!(handler.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_work() {
    let handler = Arc::new(Slow { active: AtomicUsize::new(0), peak: AtomicUsize::new(0), done: AtomicUsize::new(0) });
    let h = start(Arc::clone(&handler) as Arc<dyn MessageHandler>, 3, 4);

    h.bus.publish("test_events", "ping.sent", &ping(9)).await.expect("publish");
    assert!(eventually(Duration::from_secs(2), || handler.active.load(Ordering::SeqCst) == 1).await);

    h.shutdown.send(()).expect("consumer listening");
    tokio::time::timeout(Duration::from_secs(2), h.handle).await.expect("consumer stops").expect("no panic");

    assert_eq!(handler.done.load(Ordering::SeqCst), 1);
    assert_eq!(h.bus.acked("pings"), 1);
}
