//! Redpanda event bus for the Box Office services.
//!
//! Implements [`EventBus`] on top of rdkafka, so it works against Redpanda or
//! any Kafka-compatible broker.
//!
//! # Mapping
//!
//! | Bus concept    | Kafka                                          |
//! |----------------|------------------------------------------------|
//! | topic          | topic                                          |
//! | routing key    | record key, plus a copy inside the payload     |
//! | queue          | consumer group (`{prefix}{queue}`)             |
//! | binding filter | applied client-side; non-matching records are settled unseen |
//! | ack            | offset becomes committable                     |
//! | nack(requeue)  | record republished with `attempt + 1` for the nacking queue only, then committable |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual commits. Handlers may finish out of order,
//! so a partition's offset is only committed once every earlier delivery
//! from it is settled (see [`offsets::OffsetTracker`]). A delivery dropped
//! without being settled holds the commit point back and is redelivered
//! after the next rebalance or restart.
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_core::event_bus::{EventBus, Subscription};
//! use boxoffice_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example(event: boxoffice_core::event::SerializedEvent) -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group_prefix("boxoffice-")
//!     .build()?;
//!
//! bus.publish("payment_events", "payment.completed", &event).await?;
//!
//! let subscription = Subscription::new("booking-payments").bind("payment_events", "payment.*");
//! let mut deliveries = bus.subscribe(&subscription).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     delivery?.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod offsets;
pub mod wire;

use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::{
    Acknowledger, BoxFuture, Delivery, DeliveryStream, EventBus, EventBusError, Subscription,
};
use futures::StreamExt;
use offsets::OffsetTracker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::mpsc;
use wire::WireRecord;

/// Redpanda event bus.
///
/// Cheap to share behind an `Arc`; every subscription owns its own consumer.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group_prefix: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Broker list this bus connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn group_id(&self, subscription: &Subscription) -> String {
        format!("{}{}", self.consumer_group_prefix, subscription.queue())
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group_prefix: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses (e.g. `localhost:9092`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acks: `"0"`, `"1"` or `"all"` (default: `"all"`).
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec (default: `"none"`).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout (default: 5s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Prefix prepended to every queue name to form the consumer group.
    #[must_use]
    pub fn consumer_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_group_prefix = Some(prefix.into());
        self
    }

    /// Deliveries buffered between the Kafka consumer and the subscriber
    /// (default: 256, minimum 1).
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a consumer group without committed offsets starts
    /// (default: `"earliest"`, so a new queue sees the backlog).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group_prefix: self.consumer_group_prefix.unwrap_or_default(),
            buffer_size: self.buffer_size.unwrap_or(256),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %bus.brokers,
            acks = %acks,
            compression = %compression,
            group_prefix = %bus.consumer_group_prefix,
            "RedpandaEventBus created"
        );
        Ok(bus)
    }
}

async fn send_record(
    producer: &FutureProducer,
    topic: &str,
    record: &WireRecord,
    timeout: Duration,
) -> Result<(i32, i64), EventBusError> {
    let payload = record.encode(topic)?;
    producer
        .send(
            FutureRecord::to(topic).payload(&payload).key(record.routing_key.as_bytes()),
            Timeout::After(timeout),
        )
        .await
        .map_err(|(e, _)| EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        event: &SerializedEvent,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let topic = topic.to_string();
        let record = WireRecord::first(routing_key, event.clone());

        Box::pin(async move {
            match send_record(&self.producer, &topic, &record, self.timeout).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %record.event.event_type,
                        dedupe_key = %record.event.dedupe_key,
                        "Event published"
                    );
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to publish event");
                    Err(e)
                }
            }
        })
    }

    fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> BoxFuture<'_, Result<DeliveryStream, EventBusError>> {
        let subscription = subscription.clone();
        let group_id = self.group_id(&subscription);

        Box::pin(async move {
            let failed = |reason: String| EventBusError::SubscriptionFailed {
                queue: subscription.queue().to_string(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

            let topics = subscription.topics();
            consumer
                .subscribe(&topics)
                .map_err(|e| failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(
                queue = %subscription.queue(),
                consumer_group = %group_id,
                topics = ?topics,
                buffer_size = self.buffer_size,
                "Subscribed to topics"
            );

            let (deliveries, rx) = mpsc::channel(self.buffer_size);
            let pump = Pump {
                subscription: subscription.clone(),
                producer: self.producer.clone(),
                timeout: self.timeout,
                deliveries,
            };
            tokio::spawn(pump.run(consumer));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Position of one record, sent back to the pump once settled.
#[derive(Clone, Debug)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

struct RedpandaAcker {
    queue: String,
    position: Position,
    record: WireRecord,
    settled: mpsc::UnboundedSender<Position>,
    producer: FutureProducer,
    timeout: Duration,
}

impl RedpandaAcker {
    fn settle(&self) -> Result<(), EventBusError> {
        self.settled
            .send(self.position.clone())
            .map_err(|_| EventBusError::AckFailed("consumer task has stopped".to_string()))
    }
}

impl Acknowledger for RedpandaAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        let result = self.settle();
        Box::pin(async move { result })
    }

    fn nack(self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            if requeue {
                let retried = self.record.retried_for(&self.queue);
                send_record(&self.producer, &self.position.topic, &retried, self.timeout)
                    .await
                    .map_err(|e| EventBusError::AckFailed(format!("Failed to requeue: {e}")))?;
            }
            self.settle()
        })
    }
}

/// Owns the Kafka consumer of one subscription and feeds the delivery
/// channel until the subscriber drops it.
struct Pump {
    subscription: Subscription,
    producer: FutureProducer,
    timeout: Duration,
    deliveries: mpsc::Sender<Result<Delivery, EventBusError>>,
}

impl Pump {
    async fn run(self, consumer: StreamConsumer) {
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Position>();
        let mut tracker = OffsetTracker::new();
        let mut stream = consumer.stream();

        loop {
            tokio::select! {
                () = self.deliveries.closed() => break,
                Some(position) = settled_rx.recv() => commit(&consumer, &mut tracker, &position),
                next = stream.next() => {
                    let (position, record) = match next {
                        None => break,
                        Some(Err(e)) => {
                            let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                            if self.deliveries.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Some(Ok(message)) => {
                            let position = Position {
                                topic: message.topic().to_string(),
                                partition: message.partition(),
                                offset: message.offset(),
                            };
                            let record = message
                                .payload()
                                .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))
                                .and_then(WireRecord::decode);
                            (position, record)
                        }
                    };
                    tracker.track(&position.topic, position.partition, position.offset);

                    match record {
                        Err(e) => {
                            tracing::error!(
                                topic = %position.topic,
                                partition = position.partition,
                                offset = position.offset,
                                error = %e,
                                "Skipping undecodable record"
                            );
                            commit(&consumer, &mut tracker, &position);
                            if self.deliveries.send(Err(e)).await.is_err() {
                                break;
                            }
                        }
                        Ok(record) if !record.is_for(self.subscription.queue()) => {
                            tracing::trace!(
                                queue = %self.subscription.queue(),
                                requeued_for = ?record.requeued_for,
                                "Requeued record belongs to another queue"
                            );
                            commit(&consumer, &mut tracker, &position);
                        }
                        Ok(record) if !self.subscription.accepts(&position.topic, &record.routing_key) => {
                            tracing::trace!(
                                queue = %self.subscription.queue(),
                                routing_key = %record.routing_key,
                                "Record not bound to this queue"
                            );
                            commit(&consumer, &mut tracker, &position);
                        }
                        Ok(record) => {
                            let delivery = Delivery::new(
                                record.event.clone(),
                                position.topic.clone(),
                                record.routing_key.clone(),
                                record.attempt,
                                Box::new(RedpandaAcker {
                                    queue: self.subscription.queue().to_string(),
                                    position,
                                    record,
                                    settled: settled_tx.clone(),
                                    producer: self.producer.clone(),
                                    timeout: self.timeout,
                                }),
                            );
                            if self.deliveries.send(Ok(delivery)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        while let Ok(position) = settled_rx.try_recv() {
            commit(&consumer, &mut tracker, &position);
        }
        tracing::debug!(
            queue = %self.subscription.queue(),
            unsettled = tracker.outstanding(),
            "Consumer task exiting"
        );
    }
}

fn commit(consumer: &StreamConsumer, tracker: &mut OffsetTracker, position: &Position) {
    let Some(next) = tracker.settle(&position.topic, position.partition, position.offset) else {
        return;
    };

    let mut offsets = TopicPartitionList::new();
    let committed = offsets
        .add_partition_offset(&position.topic, position.partition, Offset::Offset(next))
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

    if let Err(e) = committed {
        tracing::warn!(
            topic = %position.topic,
            partition = position.partition,
            offset = next,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaEventBus>();
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn consumer_group_is_prefixed_queue() {
        let bus = RedpandaEventBus::builder()
            .brokers("localhost:9092")
            .consumer_group_prefix("boxoffice-")
            .build();
        if let Ok(bus) = bus {
            let subscription = Subscription::new("booking-payments").bind("payment_events", "payment.*");
            assert_eq!(bus.group_id(&subscription), "boxoffice-booking-payments");
        }
    }
}
