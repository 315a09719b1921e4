//! # Box Office Core
//!
//! Core traits and types shared by the Box Office services.
//!
//! Business rules are written as reducers: pure functions from
//! `(State, Action, Environment)` to `(State, Effects)`. Effects are plain
//! descriptions; the imperative shell (the reservation service and the saga
//! handlers) decides how to execute them inside a local transaction.
//!
//! Everything that crosses a process boundary goes through this crate:
//!
//! - [`event::SerializedEvent`]: the versioned envelope put on the wire
//! - [`event_bus::EventBus`]: publish/subscribe with explicit ack and nack
//! - [`routing`]: topic-exchange routing key patterns
//! - [`outbox::Outbox`] and [`dead_letter::DeadLetterSink`]: storage seams
//!   used by the consumer runtime
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - Explicit Effects (no hidden I/O)
//! - Dependency Injection via Environment
//! - At-least-once delivery, idempotent handlers

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod dead_letter;
pub mod event;
pub mod event_bus;
pub mod outbox;
pub mod routing;

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    /// - `Effect`: The side effect descriptions this reducer emits
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for BookingReducer {
    ///     type State = Booking;
    ///     type Action = BookingAction;
    ///     type Environment = BookingEnvironment;
    ///     type Effect = BookingEffect;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut Booking,
    ///         action: BookingAction,
    ///         env: &BookingEnvironment,
    ///     ) -> SmallVec<[BookingEffect; 4]> {
    ///         match action {
    ///             BookingAction::PaymentCompleted { payment_id } => {
    ///                 // Business logic here
    ///                 smallvec![BookingEffect::ConfirmUnits]
    ///             }
    ///             _ => SmallVec::new(),
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// The effect descriptions this reducer returns
        type Effect;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// An empty effect list means the action was a no-op.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Self::Effect; 4]>;
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use boxoffice_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
