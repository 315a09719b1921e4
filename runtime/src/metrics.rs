//! Prometheus metrics exporter.
//!
//! Counters are recorded inline with the `metrics` macros where the work
//! happens; this module installs the Prometheus recorder and describes every
//! metric the services emit.
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while installing the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to configure the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                describe_metrics();
                tracing::info!(addr = %self.addr, "Metrics exporter listening on http://{}/metrics", self.addr);
                Ok(())
            }
            Err(e) if e.to_string().contains("already initialized") => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Address the scrape endpoint listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn describe_metrics() {
    describe_counter!("bookings_created_total", "Bookings created in pending status");
    describe_counter!("bookings_rejected_total", "Booking attempts rejected, by reason");
    describe_counter!("booking_transitions_total", "Applied booking status transitions");
    describe_histogram!("booking_create_duration_seconds", "Time spent in the create-booking transaction");

    describe_counter!("consumer_messages_acked_total", "Deliveries processed and acked");
    describe_counter!("consumer_messages_retried_total", "Deliveries nacked for redelivery");
    describe_counter!("consumer_messages_dead_lettered_total", "Deliveries parked in the dead-letter store");
    describe_counter!("consumer_duplicates_skipped_total", "Deliveries skipped by the idempotency ledger");

    describe_counter!("outbox_messages_published_total", "Outbox messages relayed to the event bus");
    describe_counter!("notifications_sent_total", "Notifications handed to a sender");

    describe_counter!("dlq_entries_added_total", "Entries written to the dead-letter table");
    describe_counter!("dlq_entries_resolved_total", "Dead-letter entries marked resolved");
    describe_counter!("dlq_entries_discarded_total", "Dead-letter entries discarded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describing_without_recorder_is_harmless() {
        describe_metrics();
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert_eq!(server.addr().port(), 9090);
    }
}
