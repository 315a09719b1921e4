//! Generic event bus consumer with bounded concurrency and dead-lettering.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop so that every
//! saga handler only has to implement [`MessageHandler`].
//!
//! # Pattern
//!
//! ```text
//! loop {
//!     subscribe(queue)
//!     for each delivery (at most `prefetch` in flight):
//!         Ok            -> ack
//!         Retry         -> backoff, nack(requeue)     while attempts remain
//!         Retry (spent) -> park in dead-letter, ack
//!         DeadLetter    -> park in dead-letter, ack
//!     stream ended -> wait, resubscribe
//! }
//! ```
//!
//! On shutdown the consumer stops pulling deliveries, waits up to
//! `drain_timeout` for in-flight handlers, and drops the stream. Anything
//! still unacked at that point is redelivered by the broker later.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::builder()
//!     .subscription(Subscription::new("booking-payments").bind("payment_events", "payment.*"))
//!     .event_bus(event_bus)
//!     .handler(handler)
//!     .dead_letters(dlq)
//!     .shutdown(shutdown_rx)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use boxoffice_core::dead_letter::{DeadLetter, DeadLetterSink};
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::{Delivery, DeliveryStream, EventBus, Subscription};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How a handler failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth redelivering: infrastructure trouble or a correlated aggregate
    /// that does not exist yet.
    #[error("retryable: {0}")]
    Retry(String),

    /// Can never succeed; park it immediately.
    #[error("permanent: {0}")]
    DeadLetter(String),
}

/// Handler invoked for every delivery routed to a consumer's queue.
///
/// Handlers must be idempotent: the same envelope may arrive more than once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] to request redelivery or dead-lettering.
    async fn handle(&self, event: &SerializedEvent) -> Result<(), HandlerError>;
}

/// Errors building a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerConfigError {
    /// A required builder field was not set
    #[error("{0} is required")]
    Missing(&'static str),
}

struct Settlement {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
}

enum StreamEnd {
    Shutdown,
    Closed,
}

/// Long-running consumer for one queue.
pub struct EventConsumer {
    subscription: Subscription,
    event_bus: Arc<dyn EventBus>,
    settlement: Arc<Settlement>,
    shutdown: broadcast::Receiver<()>,
    prefetch: usize,
    reconnect_delay: Duration,
    drain_timeout: Duration,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Queue this consumer reads.
    #[must_use]
    pub fn queue(&self) -> &str {
        self.subscription.queue()
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&mut self) {
        info!(queue = %self.queue(), prefetch = self.prefetch, "Event consumer started");

        loop {
            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.event_bus.subscribe(&self.subscription) => result,
            };

            match subscribed {
                Ok(stream) => {
                    info!(queue = %self.queue(), topics = ?self.subscription.topics(), "Subscribed to event bus");
                    if matches!(self.process_stream(stream).await, StreamEnd::Shutdown) {
                        break;
                    }
                    warn!(queue = %self.queue(), delay = ?self.reconnect_delay, "Delivery stream ended, resubscribing");
                }
                Err(e) => {
                    error!(queue = %self.queue(), error = %e, delay = ?self.reconnect_delay, "Failed to subscribe");
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(queue = %self.queue(), "Event consumer stopped");
    }

    async fn process_stream(&mut self, mut stream: DeliveryStream) -> StreamEnd {
        let permits = Arc::new(Semaphore::new(self.prefetch));
        let mut in_flight = JoinSet::new();

        let end = loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %self.queue(), error = %e, "Handler task panicked");
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.recv() => break StreamEnd::Shutdown,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StreamEnd::Closed,
                },
            };

            let next = tokio::select! {
                _ = self.shutdown.recv() => break StreamEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let settlement = Arc::clone(&self.settlement);
                    in_flight.spawn(async move {
                        settlement.settle(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue(), error = %e, "Error receiving delivery");
                }
                None => break StreamEnd::Closed,
            }
        };

        self.drain(&mut in_flight).await;
        end
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        debug!(queue = %self.queue(), in_flight = in_flight.len(), "Draining in-flight handlers");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = %self.queue(),
                abandoned = in_flight.len(),
                "Drain timed out, unacked deliveries will be redelivered"
            );
            in_flight.abort_all();
        }
    }
}

impl Settlement {
    async fn settle(&self, delivery: Delivery) {
        let event_type = delivery.event().event_type.clone();
        let dedupe_key = delivery.event().dedupe_key.clone();
        let attempt = delivery.attempt();

        let outcome = self.handler.handle(delivery.event()).await;
        let failure = match outcome {
            Ok(()) => {
                match delivery.ack().await {
                    Ok(()) => {
                        metrics::counter!("consumer_messages_acked_total", "queue" => self.queue.clone()).increment(1);
                        debug!(queue = %self.queue, event_type = %event_type, dedupe_key = %dedupe_key, "Delivery acked");
                    }
                    Err(e) => warn!(queue = %self.queue, error = %e, "Ack failed, delivery may be redelivered"),
                }
                return;
            }
            Err(HandlerError::Retry(reason)) if self.retry_policy.allows_retry(attempt) => {
                let delay = self.retry_policy.backoff(usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX));
                warn!(
                    queue = %self.queue,
                    event_type = %event_type,
                    dedupe_key = %dedupe_key,
                    attempt,
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Handler failed, requeueing"
                );
                metrics::counter!("consumer_messages_retried_total", "queue" => self.queue.clone()).increment(1);
                tokio::time::sleep(delay).await;
                if let Err(e) = delivery.nack(true).await {
                    warn!(queue = %self.queue, error = %e, "Nack failed, delivery may be redelivered");
                }
                return;
            }
            Err(HandlerError::Retry(reason) | HandlerError::DeadLetter(reason)) => reason,
        };

        let letter = DeadLetter {
            queue: self.queue.clone(),
            topic: delivery.topic().to_string(),
            routing_key: delivery.routing_key().to_string(),
            event: delivery.event().clone(),
            attempts: attempt,
            error: failure,
        };

        match self.dead_letters.park(letter).await {
            Ok(()) => {
                warn!(queue = %self.queue, event_type = %event_type, dedupe_key = %dedupe_key, attempt, "Delivery dead-lettered");
                metrics::counter!("consumer_messages_dead_lettered_total", "queue" => self.queue.clone()).increment(1);
                if let Err(e) = delivery.ack().await {
                    warn!(queue = %self.queue, error = %e, "Ack after dead-letter failed");
                }
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Failed to park delivery, requeueing");
                if let Err(e) = delivery.nack(true).await {
                    warn!(queue = %self.queue, error = %e, "Nack failed, delivery may be redelivered");
                }
            }
        }
    }
}

/// Builder for [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    subscription: Option<Subscription>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn MessageHandler>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_policy: Option<RetryPolicy>,
    prefetch: Option<usize>,
    reconnect_delay: Option<Duration>,
    drain_timeout: Option<Duration>,
}

impl EventConsumerBuilder {
    /// Queue and bindings to consume.
    #[must_use]
    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Event bus instance.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Handler for each delivery.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Where exhausted deliveries are parked.
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Redelivery policy (default: [`RetryPolicy::default`]).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Maximum in-flight deliveries (default: 16, minimum 1).
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Delay before resubscribing after the stream ends (default: 5s).
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// How long shutdown waits for in-flight handlers (default: 10s).
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerConfigError::Missing`] if the subscription, event
    /// bus, handler, dead-letter sink or shutdown receiver is not set.
    pub fn build(self) -> Result<EventConsumer, ConsumerConfigError> {
        let subscription = self.subscription.ok_or(ConsumerConfigError::Missing("subscription"))?;
        Ok(EventConsumer {
            settlement: Arc::new(Settlement {
                queue: subscription.queue().to_string(),
                handler: self.handler.ok_or(ConsumerConfigError::Missing("handler"))?,
                dead_letters: self.dead_letters.ok_or(ConsumerConfigError::Missing("dead_letters"))?,
                retry_policy: self.retry_policy.unwrap_or_default(),
            }),
            subscription,
            event_bus: self.event_bus.ok_or(ConsumerConfigError::Missing("event_bus"))?,
            shutdown: self.shutdown.ok_or(ConsumerConfigError::Missing("shutdown"))?,
            prefetch: self.prefetch.unwrap_or(16).max(1),
            reconnect_delay: self.reconnect_delay.unwrap_or(Duration::from_secs(5)),
            drain_timeout: self.drain_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}
