//! Inventory aggregate: stock counts and the processed-order registry.
//!
//! **At-most-once reservation**: stock and registry live in one state value,
//! and the store runs every reduction under its write lock. The registry
//! lookup, the stock decrement and the registry insert therefore happen as
//! one check-and-set, however many consumers share the store.
//!
//! The registry keeps the decided outcome, not just the order id, together
//! with its [`Publication`] progress. Only one publish of an outcome runs at
//! a time: a duplicate arriving while it runs emits nothing. If the publish
//! failed, the next redelivery publishes the recorded outcome again without
//! touching stock.

use crate::config::AvailabilityPolicy;
use crate::events::{InventoryFailed, InventoryReserved, OrderPlaced, ReservationOutcome};
use crate::types::{ItemId, OrderId};
use campus_orders_core::{
    SmallVec, async_effect, effect::Effect, event_bus::EventBus, publish_event, reducer::Reducer,
    smallvec,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Source of randomness for [`AvailabilityPolicy::Random`].
pub trait RandomSource: Send + Sync {
    /// A sample from `[0, 1)`
    fn sample(&self) -> f64;
}

/// Thread-local RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// How far the outcome event of a decided order got
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publication {
    /// Not accepted by the broker; the next redelivery publishes it
    Pending,
    /// A publish is running
    InFlight,
    /// Accepted by the broker
    Published,
}

/// Registry entry for one processed order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    /// What was decided
    pub outcome: ReservationOutcome,
    /// Publication progress of the outcome event
    pub publication: Publication,
}

impl RegistryEntry {
    /// Whether the broker accepted the outcome event
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.publication == Publication::Published
    }
}

/// Orders already decided by Inventory Reservation.
#[derive(Clone, Debug, Default)]
pub struct ProcessedOrderRegistry {
    entries: HashMap<OrderId, RegistryEntry>,
}

impl ProcessedOrderRegistry {
    /// Whether an order has been decided
    #[must_use]
    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.entries.contains_key(order_id)
    }

    /// The entry of a decided order
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<&RegistryEntry> {
        self.entries.get(order_id)
    }

    /// Whether the outcome of an order was published
    #[must_use]
    pub fn is_published(&self, order_id: &OrderId) -> bool {
        self.entries.get(order_id).is_some_and(RegistryEntry::is_published)
    }

    /// Publication progress of an order's outcome
    #[must_use]
    pub fn publication(&self, order_id: &OrderId) -> Option<Publication> {
        self.entries.get(order_id).map(|entry| entry.publication)
    }

    /// Record a new decision whose publish is starting; an existing entry is
    /// never replaced.
    pub fn record(&mut self, outcome: ReservationOutcome) -> bool {
        let order_id = outcome.order_id().clone();
        if self.entries.contains_key(&order_id) {
            return false;
        }
        self.entries.insert(order_id, RegistryEntry {
            outcome,
            publication: Publication::InFlight,
        });
        true
    }

    /// Move the outcome of an order to a new publication state
    pub fn set_publication(&mut self, order_id: &OrderId, publication: Publication) {
        if let Some(entry) = self.entries.get_mut(order_id) {
            entry.publication = publication;
        }
    }

    /// Number of decided orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been decided yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State of Inventory Reservation
#[derive(Clone, Debug, Default)]
pub struct InventoryState {
    stock: BTreeMap<ItemId, u32>,
    /// Decided orders
    pub registry: ProcessedOrderRegistry,
}

impl InventoryState {
    /// Creates a state with the given stock and an empty registry
    #[must_use]
    pub fn with_stock<I, K>(stock: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        Self {
            stock: stock
                .into_iter()
                .map(|(item, count)| (ItemId::new(item), count))
                .collect(),
            registry: ProcessedOrderRegistry::default(),
        }
    }

    /// Current stock of an item; unknown items have none
    #[must_use]
    pub fn stock_of(&self, item: &str) -> u32 {
        self.stock.get(&ItemId::new(item)).copied().unwrap_or(0)
    }

    /// Snapshot of all stock counts
    #[must_use]
    pub fn stock(&self) -> &BTreeMap<ItemId, u32> {
        &self.stock
    }

    /// Requested quantity per item, repeated items summed, in first-seen order
    fn demand(order: &OrderPlaced) -> Vec<(ItemId, u32)> {
        let mut demand: Vec<(ItemId, u32)> = Vec::new();
        for line in &order.items {
            match demand.iter_mut().find(|(item, _)| *item == line.item_id) {
                Some((_, qty)) => *qty = qty.saturating_add(line.qty),
                None => demand.push((line.item_id.clone(), line.qty)),
            }
        }
        demand
    }

    /// Decide an order against current stock, decrementing it on success.
    ///
    /// All-or-nothing: nothing is decremented unless every item is covered.
    fn reserve(&mut self, order: &OrderPlaced) -> ReservationOutcome {
        let demand = Self::demand(order);

        let shortfall = demand.iter().find_map(|(item, need)| {
            let have = self.stock.get(item).copied().unwrap_or(0);
            (have < *need).then(|| format!("insufficient stock for {item} (have {have}, need {need})"))
        });

        if let Some(reason) = shortfall {
            return ReservationOutcome::Failed(InventoryFailed {
                order_id: order.order_id.clone(),
                reason,
                items: order.items.clone(),
            });
        }

        let mut remaining = BTreeMap::new();
        for (item, need) in demand {
            let left = self.stock.entry(item.clone()).or_insert(0);
            *left -= need;
            remaining.insert(item, *left);
        }

        ReservationOutcome::Reserved(InventoryReserved {
            order_id: order.order_id.clone(),
            items: order.items.clone(),
            remaining,
        })
    }
}

/// Actions of Inventory Reservation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryAction {
    /// Command: reserve stock for a decoded `OrderPlaced`
    Reserve {
        /// The order to reserve for
        order: OrderPlaced,
    },

    /// Feedback: the outcome event was accepted by the broker
    OutcomePublished {
        /// Order whose outcome was published
        order_id: OrderId,
    },

    /// Feedback: the outcome event could not be published
    OutcomePublishFailed {
        /// Order whose outcome is still unpublished
        order_id: OrderId,
        /// Last error
        error: String,
    },
}

/// Environment dependencies for Inventory Reservation
#[derive(Clone)]
pub struct InventoryEnvironment {
    /// Event bus for publishing outcomes
    pub event_bus: Arc<dyn EventBus>,
    /// Availability decision policy
    pub availability: AvailabilityPolicy,
    /// Randomness for [`AvailabilityPolicy::Random`]
    pub random: Arc<dyn RandomSource>,
}

impl InventoryEnvironment {
    /// Creates an environment deciding purely from stock
    #[must_use]
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus,
            availability: AvailabilityPolicy::Stock,
            random: Arc::new(ThreadRandom),
        }
    }

    /// Use a different availability policy
    #[must_use]
    pub fn with_availability(mut self, availability: AvailabilityPolicy, random: Arc<dyn RandomSource>) -> Self {
        self.availability = availability;
        self.random = random;
        self
    }
}

/// Reducer for Inventory Reservation
#[derive(Clone, Debug, Default)]
pub struct InventoryReducer;

impl InventoryReducer {
    /// Creates a new `InventoryReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn decide(state: &mut InventoryState, order: &OrderPlaced, env: &InventoryEnvironment) -> ReservationOutcome {
        if let AvailabilityPolicy::Random { failure_rate } = env.availability {
            if env.random.sample() < failure_rate {
                return ReservationOutcome::Failed(InventoryFailed {
                    order_id: order.order_id.clone(),
                    reason: "item temporarily unavailable".to_string(),
                    items: order.items.clone(),
                });
            }
        }
        state.reserve(order)
    }

    fn publish(outcome: &ReservationOutcome, env: &InventoryEnvironment) -> SmallVec<[Effect<InventoryAction>; 4]> {
        let order_id = outcome.order_id().clone();
        let message = match outcome.to_message() {
            Ok(message) => message,
            Err(error) => {
                let error = error.to_string();
                return smallvec![async_effect! {
                    Some(InventoryAction::OutcomePublishFailed { order_id, error })
                }];
            },
        };

        let failed_id = order_id.clone();
        smallvec![publish_event! {
            bus: env.event_bus,
            topic: outcome.topic(),
            event: message,
            on_success: || Some(InventoryAction::OutcomePublished { order_id }),
            on_error: |error| Some(InventoryAction::OutcomePublishFailed {
                order_id: failed_id,
                error: error.to_string()
            })
        }]
    }
}

impl Reducer for InventoryReducer {
    type State = InventoryState;
    type Action = InventoryAction;
    type Environment = InventoryEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            InventoryAction::Reserve { order } => {
                if let Some(entry) = state.registry.get(&order.order_id) {
                    match entry.publication {
                        Publication::Published => {
                            metrics::counter!("inventory.duplicates").increment(1);
                            tracing::warn!(order_id = %order.order_id, "Duplicate OrderPlaced, skipping");
                            return SmallVec::new();
                        },
                        Publication::InFlight => {
                            metrics::counter!("inventory.duplicates").increment(1);
                            tracing::info!(order_id = %order.order_id, "Duplicate OrderPlaced while its outcome is being published");
                            return SmallVec::new();
                        },
                        Publication::Pending => {
                            tracing::info!(
                                order_id = %order.order_id,
                                topic = entry.outcome.topic(),
                                "Outcome recorded but unpublished, publishing it again"
                            );
                            let effects = Self::publish(&entry.outcome, env);
                            state.registry.set_publication(&order.order_id, Publication::InFlight);
                            return effects;
                        },
                    }
                }

                let outcome = Self::decide(state, &order, env);
                match &outcome {
                    ReservationOutcome::Reserved(reserved) => {
                        metrics::counter!("inventory.reserved").increment(1);
                        tracing::info!(order_id = %order.order_id, remaining = ?reserved.remaining, "Inventory reserved");
                    },
                    ReservationOutcome::Failed(failed) => {
                        metrics::counter!("inventory.failed").increment(1);
                        tracing::warn!(order_id = %order.order_id, reason = %failed.reason, "Reservation failed");
                    },
                }

                let effects = Self::publish(&outcome, env);
                state.registry.record(outcome);
                effects
            },

            InventoryAction::OutcomePublished { order_id } => {
                state.registry.set_publication(&order_id, Publication::Published);
                SmallVec::new()
            },

            InventoryAction::OutcomePublishFailed { order_id, error } => {
                tracing::error!(order_id = %order_id, error = %error, "Outcome not published, will publish on redelivery");
                state.registry.set_publication(&order_id, Publication::Pending);
                SmallVec::new()
            },
        }
    }
}
