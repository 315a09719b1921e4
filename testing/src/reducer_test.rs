//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use boxoffice_core::reducer::Reducer;

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<F> = Box<dyn FnOnce(&[F])>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use boxoffice_testing::ReducerTest;
///
/// ReducerTest::new(BookingReducer)
///     .with_env(test_environment())
///     .given_state(pending_booking())
///     .when_action(BookingAction::PaymentFailed { reason: "declined".into() })
///     .then_state(|booking| assert_eq!(booking.status(), BookingStatus::Cancelled))
///     .then_effects(|effects| assert_eq!(effects[0], BookingEffect::ReleaseUnits))
///     .run();
/// ```
pub struct ReducerTest<R>
where
    R: Reducer,
{
    reducer: R,
    environment: Option<R::Environment>,
    initial_state: Option<R::State>,
    actions: Vec<R::Action>,
    state_assertions: Vec<StateAssertion<R::State>>,
    effect_assertions: Vec<EffectAssertion<R::Effect>>,
}

impl<R> ReducerTest<R>
where
    R: Reducer,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            actions: Vec::new(),
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: R::Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: R::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add an action to apply (When). Several calls apply the actions in
    /// order; effect assertions see the effects of the last one.
    #[must_use]
    pub fn when_action(mut self, action: R::Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&R::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the effects of the last action (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[R::Effect]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");

        assert!(!self.actions.is_empty(), "Action must be set with when_action()");

        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        let mut effects = smallvec::SmallVec::new();
        for action in self.actions {
            effects = self.reducer.reduce(&mut state, action, &env);
        }

        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if effects is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<F: std::fmt::Debug>(effects: &[F]) {
        assert!(
            effects.is_empty(),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count<F>(effects: &[F], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::{SmallVec, smallvec};

    #[derive(Clone, Debug)]
    struct Gate {
        open: bool,
    }

    #[derive(Clone, Debug)]
    enum GateAction {
        Open,
        Close,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum GateEffect {
        Opened,
    }

    struct GateReducer;

    impl Reducer for GateReducer {
        type State = Gate;
        type Action = GateAction;
        type Environment = ();
        type Effect = GateEffect;

        fn reduce(
            &self,
            state: &mut Gate,
            action: GateAction,
            _env: &(),
        ) -> SmallVec<[GateEffect; 4]> {
            match action {
                GateAction::Open if !state.open => {
                    state.open = true;
                    smallvec![GateEffect::Opened]
                }
                GateAction::Open => SmallVec::new(),
                GateAction::Close => {
                    state.open = false;
                    SmallVec::new()
                }
            }
        }
    }

    #[test]
    fn opening_emits_effect() {
        ReducerTest::new(GateReducer)
            .with_env(())
            .given_state(Gate { open: false })
            .when_action(GateAction::Open)
            .then_state(|gate| assert!(gate.open))
            .then_effects(|effects| assert_eq!(effects, [GateEffect::Opened]))
            .run();
    }

    #[test]
    fn repeated_action_reports_last_effects() {
        ReducerTest::new(GateReducer)
            .with_env(())
            .given_state(Gate { open: false })
            .when_action(GateAction::Open)
            .when_action(GateAction::Open)
            .then_state(|gate| assert!(gate.open))
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn closing_is_silent() {
        ReducerTest::new(GateReducer)
            .with_env(())
            .given_state(Gate { open: true })
            .when_action(GateAction::Close)
            .then_state(|gate| assert!(!gate.open))
            .then_effects(|effects| assertions::assert_effects_count(effects, 0))
            .run();
    }
}
