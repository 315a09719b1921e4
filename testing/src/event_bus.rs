//! In-memory event bus with queue, ack and redelivery semantics.
//!
//! Behaves like a topic exchange with durable queues:
//!
//! - publishing routes a copy to every queue whose bindings accept it
//! - subscribers sharing a queue name compete for deliveries
//! - `nack(requeue)` and dropped deliveries go back to the queue with the
//!   attempt counter incremented
//!
//! Events published before any queue is bound are recorded but not routed.

use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::{
    Acknowledger, BoxFuture, Delivery, DeliveryStream, EventBus, EventBusError, Subscription,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// An event as it was handed to [`EventBus::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedEvent {
    /// Topic published to
    pub topic: String,
    /// Routing key published with
    pub routing_key: String,
    /// The envelope
    pub event: SerializedEvent,
}

#[derive(Debug)]
struct Queued {
    topic: String,
    routing_key: String,
    event: SerializedEvent,
    attempt: u32,
}

#[derive(Default, Clone, Copy)]
struct QueueStats {
    acked: usize,
    requeued: usize,
    discarded: usize,
}

struct Queue {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<Queued>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<String, Queue>,
    stats: HashMap<String, QueueStats>,
    published: Vec<PublishedEvent>,
    failing_publishes: usize,
}

/// In-memory [`EventBus`] for tests.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.lock().published.clone()
    }

    /// Event types published so far, in order.
    #[must_use]
    pub fn published_types(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|p| p.event.event_type.clone())
            .collect()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    /// Deliveries acked on `queue`.
    #[must_use]
    pub fn acked(&self, queue: &str) -> usize {
        self.lock().stats.get(queue).map_or(0, |s| s.acked)
    }

    /// Deliveries nacked with requeue (or dropped unsettled) on `queue`.
    #[must_use]
    pub fn requeued(&self, queue: &str) -> usize {
        self.lock().stats.get(queue).map_or(0, |s| s.requeued)
    }

    /// Deliveries nacked without requeue on `queue`.
    #[must_use]
    pub fn discarded(&self, queue: &str) -> usize {
        self.lock().stats.get(queue).map_or(0, |s| s.discarded)
    }

    /// Bind a queue without consuming from it, so that events published
    /// before the consumer starts are kept.
    pub fn declare(&self, subscription: &Subscription) {
        let mut state = self.lock();
        Self::declare_locked(&mut state, subscription);
    }

    fn declare_locked(
        state: &mut BusState,
        subscription: &Subscription,
    ) -> (
        mpsc::UnboundedSender<Queued>,
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
    ) {
        let queue = state
            .queues
            .entry(subscription.queue().to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Queue {
                    subscription: subscription.clone(),
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                }
            });
        (queue.sender.clone(), Arc::clone(&queue.receiver))
    }
}

struct InMemoryAcker {
    queue: String,
    queued: Option<Queued>,
    sender: mpsc::UnboundedSender<Queued>,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryAcker {
    fn settle(&mut self, requeue: Option<bool>) {
        let Some(mut queued) = self.queued.take() else {
            return;
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = state.stats.entry(self.queue.clone()).or_default();
        match requeue {
            None => stats.acked += 1,
            Some(false) => stats.discarded += 1,
            Some(true) => {
                stats.requeued += 1;
                queued.attempt += 1;
                // The receiver lives as long as the bus; a send error only
                // happens during teardown.
                let _ = self.sender.send(queued);
            }
        }
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(mut self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        self.settle(None);
        Box::pin(async { Ok(()) })
    }

    fn nack(mut self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), EventBusError>> {
        self.settle(Some(requeue));
        Box::pin(async { Ok(()) })
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        self.settle(Some(true));
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        event: &SerializedEvent,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let result = {
            let mut state = self.lock();
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                })
            } else {
                state.published.push(PublishedEvent {
                    topic: topic.to_string(),
                    routing_key: routing_key.to_string(),
                    event: event.clone(),
                });
                for queue in state.queues.values() {
                    if queue.subscription.accepts(topic, routing_key) {
                        let _ = queue.sender.send(Queued {
                            topic: topic.to_string(),
                            routing_key: routing_key.to_string(),
                            event: event.clone(),
                            attempt: 1,
                        });
                    }
                }
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> BoxFuture<'_, Result<DeliveryStream, EventBusError>> {
        let (sender, receiver) = {
            let mut state = self.lock();
            Self::declare_locked(&mut state, subscription)
        };
        let queue = subscription.queue().to_string();
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(queued) = next else { break };
                    let delivery = Delivery::new(
                        queued.event.clone(),
                        queued.topic.clone(),
                        queued.routing_key.clone(),
                        queued.attempt,
                        Box::new(InMemoryAcker {
                            queue: queue.clone(),
                            queued: Some(queued),
                            sender: sender.clone(),
                            state: Arc::clone(&state),
                        }),
                    );
                    yield Ok(delivery);
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
