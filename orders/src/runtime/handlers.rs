//! Event handler trait and the workflow's handlers.
//!
//! A handler decides what happens to one delivery; the consumer settles it
//! afterwards:
//!
//! | Result | Settlement |
//! |--------|------------|
//! | `Ok(())` | ack |
//! | `Err(HandlerError::Malformed)` | reject (dead-letter when the queue has a DLQ) |
//! | `Err(HandlerError::Transient)` | requeue after the retry delay |

use crate::app::{InventoryService, OrderIntake, ReserveError};
use crate::events::{InventoryFailed, InventoryReserved, OrderPlaced};
use crate::notification::{Notification, Notifier, NotifyError, confirmation_message};
use crate::types::{OrderId, OrderStatus};
use async_trait::async_trait;
use campus_orders_core::environment::Clock;
use campus_orders_core::event::EventError;
use campus_orders_core::event_bus::Delivery;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a delivery could not be processed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The message can never be processed
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Processing failed for now; the message is retried
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl From<EventError> for HandlerError {
    fn from(error: EventError) -> Self {
        Self::Malformed(error.to_string())
    }
}

/// Handler for deliveries of one queue.
///
/// Implementors must be `Send + Sync + 'static` because handlers are shared
/// across consumer tasks.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one delivery. Must not settle it.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Malformed`] for payloads that can never be processed
    /// - [`HandlerError::Transient`] for failures worth retrying
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Inventory Reservation: consumes `order_placed`.
///
/// Every inventory worker gets its own handler over the same shared
/// [`InventoryService`], so all of them decide against one registry.
#[derive(Clone)]
pub struct InventoryHandler {
    service: InventoryService,
}

impl InventoryHandler {
    /// Creates a handler reserving through `service`
    #[must_use]
    pub const fn new(service: InventoryService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for InventoryHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let order = OrderPlaced::decode(&delivery.event.data)?;
        info!(
            order_id = %order.order_id,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "OrderPlaced received"
        );

        self.service.reserve(order).await.map_err(|error| match error {
            ReserveError::Unpublished(order_id) => {
                HandlerError::Transient(format!("outcome for {order_id} not published"))
            },
            ReserveError::InFlight(order_id) => {
                HandlerError::Transient(format!("outcome for {order_id} still being published"))
            },
            ReserveError::Store(error) => HandlerError::Transient(error.to_string()),
        })
    }
}

/// Notification Dispatch: consumes `inventory_reserved`.
///
/// Returns as soon as the payload is decoded; the notifier runs on a
/// detached task, so a slow or failing notifier never holds up the queue.
pub struct NotificationHandler {
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl NotificationHandler {
    /// Creates a handler dispatching through `notifier`, each call bounded by `timeout`
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            notifier,
            clock,
            timeout,
        }
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let payload: Value = serde_json::from_slice(&delivery.event.data)
            .map_err(|e| HandlerError::Malformed(format!("undecodable payload: {e}")))?;

        let order_id = payload
            .get("order_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(OrderId::new)
            .ok_or_else(|| HandlerError::Malformed("missing order_id".to_string()))?;

        let notification = Notification {
            order_id,
            message: confirmation_message(&payload),
            sent_at: self.clock.now(),
        };

        let notifier = Arc::clone(&self.notifier);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let order_id = notification.order_id.clone();
            let result = tokio::time::timeout(timeout, notifier.notify(notification))
                .await
                .unwrap_or(Err(NotifyError::Timeout(timeout)));

            match result {
                Ok(()) => {
                    metrics::counter!("notifications.sent").increment(1);
                    debug!(order_id = %order_id, "Notification dispatched");
                },
                Err(error) => {
                    metrics::counter!("notifications.failed").increment(1);
                    warn!(order_id = %order_id, error = %error, "Notification failed, not retrying");
                },
            }
        });

        Ok(())
    }
}

/// Status Callback: consumes one of the callback queues and reports the
/// reservation outcome to Order Intake.
#[derive(Clone)]
pub struct StatusCallbackHandler {
    intake: OrderIntake,
    status: OrderStatus,
}

impl StatusCallbackHandler {
    /// Handler for `InventoryReserved`
    #[must_use]
    pub const fn reserved(intake: OrderIntake) -> Self {
        Self {
            intake,
            status: OrderStatus::Reserved,
        }
    }

    /// Handler for `InventoryFailed`
    #[must_use]
    pub const fn failed(intake: OrderIntake) -> Self {
        Self {
            intake,
            status: OrderStatus::Failed,
        }
    }
}

#[async_trait]
impl EventHandler for StatusCallbackHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let (order_id, reason) = match self.status {
            OrderStatus::Failed => {
                let failed = InventoryFailed::decode(&delivery.event.data)?;
                (failed.order_id, Some(failed.reason))
            },
            OrderStatus::Reserved | OrderStatus::Placed => {
                (InventoryReserved::decode(&delivery.event.data)?.order_id, None)
            },
        };

        info!(order_id = %order_id, status = %self.status, "Status callback");
        self.intake
            .update_status(&order_id, self.status, reason)
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}
