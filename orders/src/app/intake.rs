//! Order Intake: accepts orders, owns the order store, answers queries.
//!
//! Placing an order waits only until the broker has accepted `OrderPlaced`,
//! never for the reservation. The reservation outcome arrives later through
//! [`OrderIntake::update_status`], called by the status callback.

use crate::aggregates::{OrderAction, OrderEnvironment, OrderReducer, OrderState};
use crate::types::{LineItem, Order, OrderId, OrderStatus, StudentId};
use campus_orders_core::environment::IdGenerator;
use campus_orders_runtime::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Store running the order reducer
pub type OrderStore = Store<OrderState, OrderAction, OrderEnvironment, OrderReducer>;

/// Errors returned by Order Intake
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntakeError {
    /// The request is malformed (client error)
    #[error("Invalid order request: {0}")]
    InvalidRequest(String),

    /// No order with this id
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// The order was stored but `OrderPlaced` was not accepted by the broker
    #[error("Order {order_id} stored but OrderPlaced was not published: {reason}")]
    PublishFailed {
        /// The stored order
        order_id: OrderId,
        /// Last broker error
        reason: String,
    },

    /// The generated id belongs to an order that is already stored
    #[error("Order id already in use: {0}")]
    DuplicateOrderId(OrderId),

    /// The order store refused the command
    #[error("Order store error: {0}")]
    Store(#[from] StoreError),
}

fn one() -> u32 {
    1
}

/// One requested item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestItem {
    /// Menu item
    pub item_id: String,
    /// Quantity, 1 when omitted
    #[serde(default = "one")]
    pub qty: u32,
}

/// An order request as received from a client.
///
/// Accepts both the list shape `{student_id, items: [{item_id, qty}]}` and
/// the single-item shape `{student_id, item, qty}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Student placing the order; anonymous when absent
    #[serde(default)]
    pub student_id: Option<String>,
    /// Requested items
    #[serde(default)]
    pub items: Vec<RequestItem>,
    /// Single-item shape: the item
    #[serde(default)]
    pub item: Option<String>,
    /// Single-item shape: the quantity, 1 when omitted
    #[serde(default)]
    pub qty: Option<u32>,
}

impl PlaceOrderRequest {
    /// Request for a known student
    #[must_use]
    pub fn new(student_id: impl Into<String>, items: Vec<LineItem>) -> Self {
        Self {
            student_id: Some(student_id.into()),
            ..Self::anonymous(items)
        }
    }

    /// Request without a student id
    #[must_use]
    pub fn anonymous(items: Vec<LineItem>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|line| RequestItem {
                    item_id: line.item_id.as_str().to_string(),
                    qty: line.qty,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Decode a JSON request body.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::InvalidRequest`] if the body is not a JSON
    /// object of a supported shape.
    pub fn from_json(body: &[u8]) -> Result<Self, IntakeError> {
        serde_json::from_slice(body).map_err(|e| IntakeError::InvalidRequest(e.to_string()))
    }

    /// Check the request and normalize it into a student and line items.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::InvalidRequest`] when the student id is blank,
    /// there are no items, an item id is blank or a quantity is zero.
    pub fn validate(self) -> Result<(StudentId, Vec<LineItem>), IntakeError> {
        let invalid = |reason: &str| IntakeError::InvalidRequest(reason.to_string());

        let student_id = match self.student_id {
            None => StudentId::anonymous(),
            Some(id) if id.trim().is_empty() => return Err(invalid("student_id must not be blank")),
            Some(id) => StudentId::new(id),
        };

        let requested = if self.items.is_empty() {
            self.item
                .map(|item_id| {
                    vec![RequestItem {
                        item_id,
                        qty: self.qty.unwrap_or(1),
                    }]
                })
                .unwrap_or_default()
        } else {
            self.items
        };

        if requested.is_empty() {
            return Err(invalid("items must not be empty"));
        }

        let mut items = Vec::with_capacity(requested.len());
        for item in requested {
            if item.item_id.trim().is_empty() {
                return Err(invalid("item_id must not be blank"));
            }
            if item.qty == 0 {
                return Err(IntakeError::InvalidRequest(format!(
                    "qty for {} must be at least 1",
                    item.item_id
                )));
            }
            items.push(LineItem::new(item.item_id, item.qty));
        }

        Ok((student_id, items))
    }
}

/// Handle to Order Intake, cheap to clone.
#[derive(Clone)]
pub struct OrderIntake {
    store: OrderStore,
    ids: Arc<dyn IdGenerator>,
    publish_timeout: Duration,
}

impl OrderIntake {
    /// Creates an intake over an order store.
    ///
    /// `publish_timeout` bounds how long `place_order` waits for the broker
    /// to accept `OrderPlaced`, retries included.
    #[must_use]
    pub fn new(store: OrderStore, ids: Arc<dyn IdGenerator>, publish_timeout: Duration) -> Self {
        Self {
            store,
            ids,
            publish_timeout,
        }
    }

    /// Place an order and return its id once `OrderPlaced` is published.
    ///
    /// # Errors
    ///
    /// - [`IntakeError::InvalidRequest`] for malformed requests (nothing is stored)
    /// - [`IntakeError::PublishFailed`] if the broker did not accept the event
    ///   in time; the order stays stored as `PLACED`
    /// - [`IntakeError::DuplicateOrderId`] if the id generator repeated an id;
    ///   the stored order is left untouched
    /// - [`IntakeError::Store`] if the store is shutting down
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<OrderId, IntakeError> {
        let (student_id, items) = request.validate()?;
        let order_id = OrderId::new(self.ids.next_id());

        let expected = order_id.clone();
        let feedback = self
            .store
            .send_and_wait_for(
                OrderAction::PlaceOrder {
                    order_id: order_id.clone(),
                    student_id,
                    items,
                },
                move |action| {
                    matches!(
                        action,
                        OrderAction::OrderPublished { order_id }
                        | OrderAction::PublishFailed { order_id, .. }
                        | OrderAction::DuplicateOrderId { order_id } if *order_id == expected
                    )
                },
                self.publish_timeout,
            )
            .await;

        match feedback {
            Ok(OrderAction::PublishFailed { error, .. }) => Err(IntakeError::PublishFailed {
                order_id,
                reason: error,
            }),
            Ok(OrderAction::DuplicateOrderId { .. }) => Err(IntakeError::DuplicateOrderId(order_id)),
            Ok(_) => Ok(order_id),
            Err(StoreError::Timeout) => Err(IntakeError::PublishFailed {
                order_id,
                reason: format!("broker did not accept the event within {:?}", self.publish_timeout),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Apply a reservation outcome to an order.
    ///
    /// Unknown orders, repeated updates and updates of settled orders are
    /// logged and ignored, never reported as errors.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Store`] if the store is shutting down.
    pub async fn update_status(
        &self,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<(), IntakeError> {
        let mut handle = self
            .store
            .send(OrderAction::UpdateStatus {
                order_id: order_id.clone(),
                status,
                reason,
            })
            .await?;
        handle.wait().await;
        Ok(())
    }

    /// Look up an order.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::NotFound`] for unknown ids.
    pub async fn get_order(&self, order_id: &OrderId) -> Result<Order, IntakeError> {
        self.store
            .state(|state| state.get(order_id).cloned())
            .await
            .ok_or_else(|| IntakeError::NotFound(order_id.clone()))
    }

    /// All orders, oldest first
    pub async fn list_orders(&self) -> Vec<Order> {
        self.store.state(OrderState::list).await
    }

    /// Stop accepting commands and wait for in-flight publishes.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Store`] if publishes are still running at the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), IntakeError> {
        self.store.shutdown(timeout).await.map_err(IntakeError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use campus_orders_core::event_bus::EventBus;
    use campus_orders_runtime::RetryPolicy;
    use campus_orders_testing::mocks::{FlakyEventBus, RecordingEventBus, SequentialIdGenerator};
    use campus_orders_testing::test_clock;

    fn intake_over(bus: Arc<dyn EventBus>) -> OrderIntake {
        let store = Store::with_retry_policy(
            OrderState::new(),
            OrderReducer::new(),
            OrderEnvironment::new(Arc::new(test_clock()), bus),
            RetryPolicy::immediate(2),
        );
        OrderIntake::new(store, Arc::new(SequentialIdGenerator::new("ORD")), Duration::from_secs(2))
    }

    #[test]
    fn single_item_shape_defaults_qty_and_student() {
        let request = PlaceOrderRequest::from_json(br#"{"item":"Burger"}"#).unwrap();
        let (student, items) = request.validate().unwrap();

        assert_eq!(student, StudentId::anonymous());
        assert_eq!(items, vec![LineItem::new("Burger", 1)]);
    }

    #[test]
    fn list_shape_is_decoded() {
        let body = br#"{"student_id":"S1","items":[{"item_id":"Pizza","qty":2},{"item_id":"Coffee"}]}"#;
        let (student, items) = PlaceOrderRequest::from_json(body).unwrap().validate().unwrap();

        assert_eq!(student, StudentId::new("S1"));
        assert_eq!(items, vec![LineItem::new("Pizza", 2), LineItem::new("Coffee", 1)]);
    }

    #[test]
    fn malformed_requests_are_client_errors() {
        let cases = [
            PlaceOrderRequest::new("S1", vec![]),
            PlaceOrderRequest::new("  ", vec![LineItem::new("Pizza", 1)]),
            PlaceOrderRequest::new("S1", vec![LineItem::new("", 1)]),
            PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 0)]),
        ];
        for request in cases {
            assert!(matches!(request.validate(), Err(IntakeError::InvalidRequest(_))));
        }
        assert!(matches!(
            PlaceOrderRequest::from_json(b"not json"),
            Err(IntakeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn place_order_stores_and_publishes() {
        let recorder = Arc::new(RecordingEventBus::new());
        let intake = intake_over(recorder.clone());

        let order_id = intake
            .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 2)]))
            .await
            .unwrap();

        assert_eq!(order_id, OrderId::new("ORD-1"));
        assert_eq!(recorder.topics(), vec!["order.placed".to_string()]);

        let order = intake.get_order(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Placed);
        assert_eq!(order.student_id, StudentId::new("S1"));
    }

    #[tokio::test]
    async fn invalid_request_stores_nothing() {
        let intake = intake_over(Arc::new(RecordingEventBus::new()));

        let result = intake.place_order(PlaceOrderRequest::new("S1", vec![])).await;
        assert!(matches!(result, Err(IntakeError::InvalidRequest(_))));
        assert!(intake.list_orders().await.is_empty());
    }

    #[tokio::test]
    async fn unpublished_order_is_kept_as_placed() {
        let recorder = Arc::new(RecordingEventBus::new());
        let intake = intake_over(Arc::new(FlakyEventBus::new(recorder.clone(), 10)));

        let result = intake
            .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Taco", 1)]))
            .await;

        let Err(IntakeError::PublishFailed { order_id, reason }) = result else {
            unreachable!("expected PublishFailed, got {result:?}");
        };
        assert!(reason.contains("injected failure"));
        assert!(recorder.published().is_empty());
        assert_eq!(intake.get_order(&order_id).await.unwrap().status, OrderStatus::Placed);
    }

    struct RepeatingIds;

    impl IdGenerator for RepeatingIds {
        fn next_id(&self) -> String {
            "ORD-7".to_string()
        }
    }

    #[tokio::test]
    async fn repeated_id_is_refused_without_waiting_for_the_broker() {
        let recorder = Arc::new(RecordingEventBus::new());
        let store = Store::with_retry_policy(
            OrderState::new(),
            OrderReducer::new(),
            OrderEnvironment::new(Arc::new(test_clock()), recorder.clone()),
            RetryPolicy::immediate(2),
        );
        let intake = OrderIntake::new(store, Arc::new(RepeatingIds), Duration::from_secs(5));

        intake
            .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 1)]))
            .await
            .unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(500),
            intake.place_order(PlaceOrderRequest::new("S2", vec![LineItem::new("Taco", 3)])),
        )
        .await
        .unwrap();

        assert_eq!(second, Err(IntakeError::DuplicateOrderId(OrderId::new("ORD-7"))));
        assert_eq!(recorder.topics().len(), 1);
        let kept = intake.get_order(&OrderId::new("ORD-7")).await.unwrap();
        assert_eq!(kept.student_id, StudentId::new("S1"));
    }

    #[tokio::test]
    async fn status_updates_and_lookups() {
        let intake = intake_over(Arc::new(RecordingEventBus::new()));
        let order_id = intake
            .place_order(PlaceOrderRequest::anonymous(vec![LineItem::new("Sushi", 1)]))
            .await
            .unwrap();

        intake
            .update_status(&order_id, OrderStatus::Failed, Some("sold out".to_string()))
            .await
            .unwrap();
        intake
            .update_status(&OrderId::new("ORD-404"), OrderStatus::Reserved, None)
            .await
            .unwrap();

        let order = intake.get_order(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure_reason.as_deref(), Some("sold out"));

        assert_eq!(
            intake.get_order(&OrderId::new("ORD-404")).await,
            Err(IntakeError::NotFound(OrderId::new("ORD-404")))
        );
        assert_eq!(intake.list_orders().await.len(), 1);
    }
}
