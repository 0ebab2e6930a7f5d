//! Broker topology of the workflow: routing keys, queues and bindings.
//!
//! ```text
//! order.placed        → order_placed               (dead-letters to order.placed.dlq)
//! inventory.reserved  → inventory_reserved         (notification dispatch)
//!                     → order_callback_reserved    (status callback)
//! inventory.failed    → order_callback_failed      (status callback)
//! ```

use campus_orders_core::event_bus::{EventBus, EventBusError, QueueSpec};
use campus_orders_runtime::{RetryPolicy, retry::retry_with_backoff};

/// Routing key of `OrderPlaced`
pub const ORDER_PLACED: &str = "order.placed";
/// Routing key of `InventoryReserved`
pub const INVENTORY_RESERVED: &str = "inventory.reserved";
/// Routing key of `InventoryFailed`
pub const INVENTORY_FAILED: &str = "inventory.failed";
/// Dead-letter routing key of the order queue; also the name of the DLQ
pub const ORDER_PLACED_DLQ: &str = "order.placed.dlq";

/// Queue consumed by Inventory Reservation
pub const ORDER_PLACED_QUEUE: &str = "order_placed";
/// Queue consumed by Notification Dispatch
pub const INVENTORY_RESERVED_QUEUE: &str = "inventory_reserved";
/// Queue consumed by Status Callback for reservations
pub const CALLBACK_RESERVED_QUEUE: &str = "order_callback_reserved";
/// Queue consumed by Status Callback for failures
pub const CALLBACK_FAILED_QUEUE: &str = "order_callback_failed";

/// One queue and the routing key it is bound with.
///
/// The dead-letter queue has no binding: it is only reached through
/// dead-letter routing.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// Queue declaration
    pub spec: QueueSpec,
    /// Topic pattern bound to the exchange
    pub pattern: Option<&'static str>,
}

/// Every queue of the workflow, dead-letter queue first so it exists before
/// anything can be rejected into it.
#[must_use]
pub fn bindings() -> Vec<QueueBinding> {
    vec![
        QueueBinding {
            spec: QueueSpec::new(ORDER_PLACED_DLQ),
            pattern: None,
        },
        QueueBinding {
            spec: QueueSpec::new(ORDER_PLACED_QUEUE).with_dead_letter(ORDER_PLACED_DLQ),
            pattern: Some(ORDER_PLACED),
        },
        QueueBinding {
            spec: QueueSpec::new(INVENTORY_RESERVED_QUEUE),
            pattern: Some(INVENTORY_RESERVED),
        },
        QueueBinding {
            spec: QueueSpec::new(CALLBACK_RESERVED_QUEUE),
            pattern: Some(INVENTORY_RESERVED),
        },
        QueueBinding {
            spec: QueueSpec::new(CALLBACK_FAILED_QUEUE),
            pattern: Some(INVENTORY_FAILED),
        },
    ]
}

/// Declare and bind every queue, retrying while the broker is unreachable.
///
/// Declaring is idempotent, so this is safe to run on every start.
///
/// # Errors
///
/// Returns the last broker error once the retry policy is exhausted.
pub async fn declare(bus: &dyn EventBus, policy: &RetryPolicy) -> Result<(), EventBusError> {
    for binding in bindings() {
        retry_with_backoff(policy, "declare_queue", || bus.declare_queue(&binding.spec)).await?;

        if let Some(pattern) = binding.pattern {
            retry_with_backoff(policy, "bind_queue", || {
                bus.bind_queue(&binding.spec.name, pattern)
            })
            .await?;
        }

        tracing::debug!(queue = %binding.spec.name, pattern = ?binding.pattern, "Queue declared");
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use campus_orders_broker::InMemoryBroker;
    use campus_orders_core::event::SerializedEvent;

    #[tokio::test]
    async fn reserved_outcome_fans_out_to_two_queues() {
        let broker = InMemoryBroker::new();
        declare(&broker, &RetryPolicy::immediate(1)).await.unwrap();

        broker
            .publish(INVENTORY_RESERVED, &SerializedEvent::raw("{}"))
            .await
            .unwrap();

        assert_eq!(broker.message_count(INVENTORY_RESERVED_QUEUE).await, Ok(1));
        assert_eq!(broker.message_count(CALLBACK_RESERVED_QUEUE).await, Ok(1));
        assert_eq!(broker.message_count(CALLBACK_FAILED_QUEUE).await, Ok(0));
        assert_eq!(broker.message_count(ORDER_PLACED_QUEUE).await, Ok(0));
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        declare(&broker, &RetryPolicy::immediate(1)).await.unwrap();
        broker
            .publish(ORDER_PLACED, &SerializedEvent::raw("{}"))
            .await
            .unwrap();

        declare(&broker, &RetryPolicy::immediate(1)).await.unwrap();
        assert_eq!(broker.message_count(ORDER_PLACED_QUEUE).await, Ok(1));
    }

    #[tokio::test]
    async fn declare_fails_while_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let result = declare(&broker, &RetryPolicy::immediate(2)).await;
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }
}
