//! Notification Dispatch: best-effort order confirmations.
//!
//! Nothing here is on the commit path of an order. Notifier failures are
//! logged and counted, never retried.

use crate::types::OrderId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// A confirmation sent to a student
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Confirmed order
    pub order_id: OrderId,
    /// Human-readable text
    pub message: String,
    /// When the notification was dispatched
    pub sent_at: DateTime<Utc>,
}

/// Errors returned by a [`Notifier`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// The delivery channel refused the notification
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    /// The notifier did not answer in time
    #[error("Notification timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Delivery channel for confirmations
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Send one notification.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the notification could not be delivered.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Every notification sent so far, shared between the notifier and readers.
#[derive(Clone, Debug, Default)]
pub struct NotificationLog {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationLog {
    /// Creates an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }

    /// Notifications in dispatch order
    #[must_use]
    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of notifications sent
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or_default()
    }

    /// Whether nothing was sent yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notifier that writes a log line and records the notification.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    log: NotificationLog,
}

impl LogNotifier {
    /// Creates a notifier recording into `log`
    #[must_use]
    pub const fn new(log: NotificationLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            order_id = %notification.order_id,
            message = %notification.message,
            "Notification sent"
        );
        self.log.record(notification);
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "???".to_string(),
    }
}

/// Confirmation text for an `InventoryReserved` payload.
///
/// Uses the `items` array when present, otherwise the single-item `item`
/// and `qty` fields. Missing values render as `???`.
#[must_use]
pub fn confirmation_message(payload: &Value) -> String {
    let lines: Vec<String> = match payload.get("items").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|line| {
                let item = line.get("item_id").or_else(|| line.get("item"));
                format!("{}x {}", render(line.get("qty")), render(item))
            })
            .collect(),
        _ => vec![format!("{}x {}", render(payload.get("qty")), render(payload.get("item")))],
    };

    format!("Your order for {} has been confirmed!", lines.join(", "))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use campus_orders_core::environment::Clock;
    use campus_orders_testing::test_clock;
    use serde_json::json;

    #[test]
    fn message_lists_every_item() {
        let payload = json!({
            "order_id": "ORD-1",
            "items": [{"item_id": "Pizza", "qty": 2}, {"item_id": "Coffee", "qty": 1}]
        });
        assert_eq!(
            confirmation_message(&payload),
            "Your order for 2x Pizza, 1x Coffee has been confirmed!"
        );
    }

    #[test]
    fn single_item_shape_and_missing_fields() {
        assert_eq!(
            confirmation_message(&json!({"order_id": "ORD-1", "item": "Burger", "qty": 3})),
            "Your order for 3x Burger has been confirmed!"
        );
        assert_eq!(
            confirmation_message(&json!({"order_id": "ORD-1"})),
            "Your order for ???x ??? has been confirmed!"
        );
        assert_eq!(
            confirmation_message(&json!({"items": [{"qty": 1}]})),
            "Your order for 1x ??? has been confirmed!"
        );
    }

    #[tokio::test]
    async fn log_notifier_records_notifications() {
        let log = NotificationLog::new();
        let notifier = LogNotifier::new(log.clone());

        notifier
            .notify(Notification {
                order_id: OrderId::new("ORD-1"),
                message: "hello".to_string(),
                sent_at: test_clock().now(),
            })
            .await
            .unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.all()[0].order_id, OrderId::new("ORD-1"));
    }
}
