//! # Box Office Runtime
//!
//! The imperative shell around the event bus.
//!
//! ## Core Components
//!
//! - **[`consumer::EventConsumer`]**: subscribe-process-reconnect loop with a
//!   prefetch bound, ack/nack settlement and dead-lettering
//! - **[`relay::OutboxRelay`]**: publishes committed outbox messages in order
//! - **[`retry::RetryPolicy`]**: exponential backoff shared by both
//! - **[`metrics::MetricsServer`]**: Prometheus exporter
//!
//! ## Example
//!
//! ```ignore
//! let (shutdown_tx, _) = broadcast::channel(1);
//!
//! let relay = OutboxRelay::new(outbox, Arc::clone(&event_bus)).spawn(shutdown_tx.subscribe());
//! let consumer = EventConsumer::builder()
//!     .subscription(Subscription::new("booking-payments").bind("payment_events", "payment.*"))
//!     .event_bus(event_bus)
//!     .handler(payment_saga)
//!     .dead_letters(dlq)
//!     .shutdown(shutdown_tx.subscribe())
//!     .build()?
//!     .spawn();
//! ```

pub mod consumer;
pub mod metrics;
pub mod relay;
pub mod retry;

pub use consumer::{EventConsumer, HandlerError, MessageHandler};
pub use relay::OutboxRelay;
pub use retry::RetryPolicy;
