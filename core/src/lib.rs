//! # Campus Orders Core
//!
//! Core traits and types for the campus food-ordering workflow.
//!
//! This crate provides the abstractions every service in the workflow is
//! built from: reducers that hold the business logic, effect descriptions
//! that the runtime executes, injected environment traits, and the broker
//! abstraction that carries events between services.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one service (orders, inventory counts)
//! - **Action**: All possible inputs to a reducer (commands, events, feedback)
//! - **Reducer**: Pure function `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions (not execution)
//! - **Environment**: Injected dependencies via traits
//! - **Event bus**: Durable FIFO queues with explicit acknowledgement
//!
//! ## Example
//!
//! ```ignore
//! use campus_orders_core::*;
//!
//! impl Reducer for InventoryReducer {
//!     type State = InventoryState;
//!     type Action = InventoryAction;
//!     type Environment = InventoryEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut InventoryState,
//!         action: InventoryAction,
//!         env: &InventoryEnvironment,
//!     ) -> SmallVec<[Effect<InventoryAction>; 4]> {
//!         // Business logic goes here
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod effect_macros;
pub mod event;
pub mod event_bus;

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::SmallVec;
    use super::effect::Effect;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for OrderReducer {
    ///     type State = OrderState;
    ///     type Action = OrderAction;
    ///     type Environment = OrderEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut OrderState,
    ///         action: OrderAction,
    ///         env: &OrderEnvironment,
    ///     ) -> SmallVec<[Effect<OrderAction>; 4]> {
    ///         match action {
    ///             OrderAction::PlaceOrder { .. } => smallvec![Effect::None],
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

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution) and are composable.
pub mod effect {
    use crate::event::SerializedEvent;
    use crate::event_bus::{EventBus, EventBusError};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    /// Callback invoked with the result of an event bus operation.
    pub type Callback<T, Action> = Box<dyn FnOnce(T) -> Option<Action> + Send>;

    /// Event bus operations that can be described as effects.
    pub enum EventBusOperation<Action> {
        /// Publish an event under a routing key.
        Publish {
            /// Broker to publish to
            event_bus: Arc<dyn EventBus>,
            /// Routing key (e.g. `order.placed`)
            topic: String,
            /// The event to publish
            event: SerializedEvent,
            /// Produces the feedback action once the broker accepted the event
            on_success: Callback<(), Action>,
            /// Produces the feedback action once retries are exhausted
            on_error: Callback<EventBusError, Action>,
        },
    }

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// Publish an event to the broker (retried by the runtime)
        PublishEvent(EventBusOperation<Action>),
    }

    // Manual Debug implementation since Future and callbacks don't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::PublishEvent(EventBusOperation::Publish { topic, event, .. }) => f
                    .debug_struct("Effect::PublishEvent")
                    .field("topic", topic)
                    .field("event_type", &event.event_type)
                    .finish_non_exhaustive(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Returns the routing key if this is a publish effect
        #[must_use]
        pub fn published_topic(&self) -> Option<&str> {
            match self {
                Effect::PublishEvent(EventBusOperation::Publish { topic, .. }) => {
                    Some(topic.as_str())
                },
                _ => None,
            }
        }
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
    /// use campus_orders_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Generates unique identifiers for newly created aggregates.
    pub trait IdGenerator: Send + Sync {
        /// Produce the next identifier
        fn next_id(&self) -> String;
    }
}
