//! Given-When-Then harness for reducers.
//!
//! Reducers are pure, so most business rules can be checked without a
//! runtime: give a state, apply one action, assert on the new state and the
//! effect descriptions that came back.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use campus_orders_core::{effect::Effect, reducer::Reducer};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers
///
/// # Example
///
/// ```ignore
/// use campus_orders_testing::{ReducerTest, assertions};
///
/// ReducerTest::new(InventoryReducer)
///     .with_env(test_environment())
///     .given_state(InventoryState::with_stock([("Pizza", 5)]))
///     .when_action(InventoryAction::Reserve { order })
///     .then_state(|state| assert_eq!(state.stock_of("Pizza"), Some(3)))
///     .then_effects(|effects| assertions::assert_publishes_to(effects, "inventory.reserved"))
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    actions: Vec<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
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
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add an action to apply (When)
    ///
    /// Several calls apply the actions in order; effect assertions see the
    /// effects of the last one.
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the effects of the last action (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if the state, environment or actions are missing, or if any
    /// assertion fails.
    #[allow(clippy::panic)] // Test harness
    #[allow(clippy::expect_used)] // Test harness
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");
        assert!(!self.actions.is_empty(), "At least one action must be set with when_action()");

        let mut effects = Vec::new();
        for action in self.actions {
            effects = self.reducer.reduce(&mut state, action, &env).into_vec();
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
    use campus_orders_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if any effect other than `Effect::None` is present.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().all(|e| matches!(e, Effect::None)),
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
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Future(_))),
            "Expected at least one Future effect, but none found"
        );
    }

    /// Routing keys of every publish effect, in order
    #[must_use]
    pub fn published_topics<A>(effects: &[Effect<A>]) -> Vec<String> {
        effects
            .iter()
            .filter_map(Effect::published_topic)
            .map(str::to_string)
            .collect()
    }

    /// Assert that exactly one publish effect targets `topic`
    ///
    /// # Panics
    ///
    /// Panics if the effects publish to `topic` zero or several times.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_publishes_to<A>(effects: &[Effect<A>], topic: &str) {
        let topics = published_topics(effects);
        assert_eq!(
            topics.iter().filter(|t| *t == topic).count(),
            1,
            "Expected one publish to '{topic}', found {topics:?}"
        );
    }

    /// Assert that nothing is published
    ///
    /// # Panics
    ///
    /// Panics if any publish effect is present.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_publish<A>(effects: &[Effect<A>]) {
        let topics = published_topics(effects);
        assert!(topics.is_empty(), "Expected no publish, found {topics:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_orders_core::{SmallVec, smallvec};

    #[derive(Clone, Debug)]
    struct TestState {
        count: i32,
    }

    #[derive(Clone, Debug)]
    enum TestAction {
        Increment,
        Decrement,
        Later,
    }

    struct TestReducer;

    struct TestEnv;

    impl Reducer for TestReducer {
        type State = TestState;
        type Action = TestAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            state: &mut TestState,
            action: TestAction,
            _env: &TestEnv,
        ) -> SmallVec<[Effect<TestAction>; 4]> {
            match action {
                TestAction::Increment => {
                    state.count += 1;
                    smallvec![Effect::None]
                },
                TestAction::Decrement => {
                    state.count -= 1;
                    SmallVec::new()
                },
                TestAction::Later => {
                    smallvec![Effect::Future(Box::pin(async { Some(TestAction::Increment) }))]
                },
            }
        }
    }

    #[test]
    fn applies_actions_in_order() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 0 })
            .when_action(TestAction::Increment)
            .when_action(TestAction::Increment)
            .when_action(TestAction::Decrement)
            .then_state(|state| assert_eq!(state.count, 1))
            .then_effects(|effects| {
                assertions::assert_no_effects(effects);
                assertions::assert_no_publish(effects);
            })
            .run();
    }

    #[test]
    fn effects_belong_to_last_action() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 0 })
            .when_action(TestAction::Later)
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }
}
