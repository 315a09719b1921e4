//! Outbox relay: moves committed outbox rows onto the event bus.
//!
//! The relay publishes strictly in outbox order and stops a pass at the
//! first publish failure, so a later message never overtakes an earlier one
//! from the same outbox. Whatever was not published is picked up on the next
//! pass.

use boxoffice_core::event_bus::{EventBus, EventBusError};
use boxoffice_core::outbox::{Outbox, OutboxError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

/// Errors from a relay pass.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Reading or updating the outbox failed
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Publishing to the event bus failed
    #[error(transparent)]
    Bus(#[from] EventBusError),
}

/// Publishes pending outbox messages.
#[derive(Clone)]
pub struct OutboxRelay {
    outbox: Arc<dyn Outbox>,
    event_bus: Arc<dyn EventBus>,
    wake: Arc<Notify>,
    poll_interval: Duration,
    batch_size: usize,
}

impl OutboxRelay {
    /// Create a relay with a 1s poll interval and batches of 100.
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            outbox,
            event_bus,
            wake: Arc::new(Notify::new()),
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }

    /// Set how often the relay polls without being woken.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how many messages are read per batch (minimum 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Handle used by writers to wake the relay right after a commit.
    #[must_use]
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Publish everything currently pending.
    ///
    /// Returns the number of messages published.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the outbox cannot be read or a publish
    /// fails. Messages published before the failure are still marked.
    pub async fn relay_pending(&self) -> Result<usize, RelayError> {
        let mut total = 0;

        loop {
            let batch = self.outbox.pending(self.batch_size).await?;
            let fetched = batch.len();
            let mut published = Vec::with_capacity(fetched);
            let mut failure = None;

            for message in batch {
                match self
                    .event_bus
                    .publish(&message.topic, &message.routing_key, &message.event)
                    .await
                {
                    Ok(()) => published.push(message.id),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if !published.is_empty() {
                self.outbox.mark_published(&published).await?;
                metrics::counter!("outbox_messages_published_total").increment(published.len() as u64);
                total += published.len();
            }

            if let Some(e) = failure {
                return Err(e.into());
            }
            if fetched < self.batch_size {
                return Ok(total);
            }
        }
    }

    /// Spawn the relay loop until the shutdown signal fires.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(poll_interval = ?self.poll_interval, batch_size = self.batch_size, "Outbox relay started");
            loop {
                match self.relay_pending().await {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "Relayed outbox messages"),
                    Err(e) => warn!(error = %e, "Outbox relay pass failed, retrying next tick"),
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = self.wake.notified() => {}
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            info!("Outbox relay stopped");
        })
    }
}
