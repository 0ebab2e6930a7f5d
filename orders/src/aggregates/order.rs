//! Order aggregate owned by Order Intake.
//!
//! Holds every order placed through this process and is the only place an
//! order's status changes. Placing an order stores it as `PLACED` and
//! publishes `OrderPlaced`; the status callback moves it to a terminal
//! status.

use crate::events::{self, OrderPlaced};
use crate::topology;
use crate::types::{LineItem, Order, OrderId, OrderStatus, StudentId};
use campus_orders_core::{
    SmallVec, async_effect, effect::Effect, environment::Clock, event_bus::EventBus,
    publish_event, reducer::Reducer, smallvec,
};
use std::collections::HashMap;
use std::sync::Arc;

/// State of the order store
#[derive(Clone, Debug, Default)]
pub struct OrderState {
    orders: HashMap<OrderId, Order>,
    /// Order ids in placement order
    placed: Vec<OrderId>,
}

impl OrderState {
    /// Creates an empty order store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an order
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// All orders, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<Order> {
        self.placed
            .iter()
            .filter_map(|id| self.orders.get(id))
            .cloned()
            .collect()
    }

    /// Number of stored orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Whether no order has been placed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Commands and feedback for the order store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderAction {
    // ========== Commands ==========
    /// Command: store a new order and announce it
    PlaceOrder {
        /// Pre-generated order identifier
        order_id: OrderId,
        /// Student placing the order
        student_id: StudentId,
        /// Validated, non-empty items
        items: Vec<LineItem>,
    },

    /// Command: record the outcome of the reservation
    UpdateStatus {
        /// Order to update
        order_id: OrderId,
        /// New status
        status: OrderStatus,
        /// Failure reason (for `Failed`)
        reason: Option<String>,
    },

    // ========== Feedback ==========
    /// The broker accepted `OrderPlaced`
    OrderPublished {
        /// Published order
        order_id: OrderId,
    },

    /// `OrderPlaced` could not be published
    PublishFailed {
        /// Order whose event was not published
        order_id: OrderId,
        /// Last error
        error: String,
    },

    /// `PlaceOrder` was refused because its id belongs to a stored order
    DuplicateOrderId {
        /// The id already in use
        order_id: OrderId,
    },
}

/// Environment dependencies for the order store
#[derive(Clone)]
pub struct OrderEnvironment {
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Event bus for publishing
    pub event_bus: Arc<dyn EventBus>,
}

impl OrderEnvironment {
    /// Creates a new `OrderEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, event_bus: Arc<dyn EventBus>) -> Self {
        Self { clock, event_bus }
    }
}

/// Reducer for the order store
#[derive(Clone, Debug, Default)]
pub struct OrderReducer;

impl OrderReducer {
    /// Creates a new `OrderReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn place_order(
        state: &mut OrderState,
        order_id: OrderId,
        student_id: StudentId,
        items: Vec<LineItem>,
        env: &OrderEnvironment,
    ) -> SmallVec<[Effect<OrderAction>; 4]> {
        if state.orders.contains_key(&order_id) {
            tracing::warn!(order_id = %order_id, "Order id already in use, refusing PlaceOrder");
            return smallvec![async_effect! {
                Some(OrderAction::DuplicateOrderId { order_id })
            }];
        }

        let now = env.clock.now();
        let order = Order {
            id: order_id.clone(),
            student_id: student_id.clone(),
            items: items.clone(),
            status: OrderStatus::Placed,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(order_id.clone(), order);
        state.placed.push(order_id.clone());

        metrics::counter!("orders.placed").increment(1);
        tracing::info!(order_id = %order_id, student_id = %student_id, items = items.len(), "Order placed");

        let event = OrderPlaced {
            order_id: order_id.clone(),
            student_id,
            items,
        };

        match events::to_message(&event) {
            Ok(message) => {
                let failed_id = order_id.clone();
                smallvec![publish_event! {
                    bus: env.event_bus,
                    topic: topology::ORDER_PLACED,
                    event: message,
                    on_success: || Some(OrderAction::OrderPublished { order_id }),
                    on_error: |error| Some(OrderAction::PublishFailed {
                        order_id: failed_id,
                        error: error.to_string()
                    })
                }]
            },
            Err(error) => {
                let error = error.to_string();
                smallvec![async_effect! {
                    Some(OrderAction::PublishFailed { order_id, error })
                }]
            },
        }
    }

    fn update_status(
        state: &mut OrderState,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<String>,
        env: &OrderEnvironment,
    ) {
        let Some(order) = state.orders.get_mut(order_id) else {
            tracing::warn!(order_id = %order_id, status = %status, "Status update for unknown order ignored");
            return;
        };

        if order.status == status {
            tracing::debug!(order_id = %order_id, status = %status, "Status unchanged");
            return;
        }

        if order.status.is_terminal() {
            tracing::warn!(
                order_id = %order_id,
                current = %order.status,
                requested = %status,
                "Order already settled, conflicting status update ignored"
            );
            return;
        }

        order.status = status;
        order.failure_reason = match status {
            OrderStatus::Failed => Some(reason.unwrap_or_else(|| "unknown".to_string())),
            OrderStatus::Placed | OrderStatus::Reserved => None,
        };
        order.updated_at = env.clock.now();

        metrics::counter!("orders.status_updated", "status" => status.to_string()).increment(1);
        tracing::info!(order_id = %order_id, status = %status, reason = ?order.failure_reason, "Order status updated");
    }
}

impl Reducer for OrderReducer {
    type State = OrderState;
    type Action = OrderAction;
    type Environment = OrderEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            OrderAction::PlaceOrder {
                order_id,
                student_id,
                items,
            } => Self::place_order(state, order_id, student_id, items, env),

            OrderAction::UpdateStatus {
                order_id,
                status,
                reason,
            } => {
                Self::update_status(state, &order_id, status, reason, env);
                SmallVec::new()
            },

            OrderAction::OrderPublished { order_id } => {
                tracing::debug!(order_id = %order_id, "OrderPlaced accepted by broker");
                SmallVec::new()
            },

            OrderAction::PublishFailed { order_id, error } => {
                metrics::counter!("orders.publish_failed").increment(1);
                tracing::error!(order_id = %order_id, error = %error, "OrderPlaced was not published, order stays PLACED");
                SmallVec::new()
            },

            OrderAction::DuplicateOrderId { .. } => SmallVec::new(),
        }
    }
}
