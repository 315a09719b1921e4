//! # Box Office Testing
//!
//! Testing utilities for the Box Office crates.
//!
//! This crate provides:
//! - [`FixedClock`] and [`test_clock`] for deterministic time
//! - [`ReducerTest`], a given/when/then builder for reducers
//! - [`InMemoryEventBus`] with real ack/nack/redelivery semantics
//! - [`InMemoryOutbox`] and [`InMemoryDeadLetters`] for the runtime seams
//! - [`init_tracing`] and [`eventually`] for async integration tests
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::{InMemoryEventBus, eventually};
//!
//! #[tokio::test]
//! async fn payment_confirms_booking() {
//!     let bus = InMemoryEventBus::new();
//!     // ... spawn a consumer on `bus`, publish a payment event ...
//!     assert!(eventually(Duration::from_secs(2), || bus.acked("booking-payments") == 1).await);
//! }
//! ```

use chrono::{DateTime, Utc};
use boxoffice_core::environment::Clock;
use std::time::Duration;

pub mod event_bus;
pub mod reducer_test;
pub mod stores;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a test-friendly tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Re-export commonly used items
pub use event_bus::{InMemoryEventBus, PublishedEvent};
pub use mocks::{FixedClock, test_clock};
pub use reducer_test::{ReducerTest, assertions};
pub use stores::{InMemoryDeadLetters, InMemoryOutbox};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_does_not_move() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn eventually_gives_up() {
        assert!(!eventually(Duration::from_millis(20), || false).await);
        assert!(eventually(Duration::from_millis(20), || true).await);
    }
}
