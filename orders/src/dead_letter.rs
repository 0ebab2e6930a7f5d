//! Offline inspection of the dead-letter queue.
//!
//! Nothing consumes the DLQ automatically. Operators look at the records
//! and decide what to do with them.

use crate::topology::ORDER_PLACED_DLQ;
use campus_orders_broker::X_DEATH_HEADER;
use campus_orders_core::event_bus::{Delivery, EventBus, EventBusError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// A dead-lettered message and why it was rejected
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Original message body
    pub payload: Vec<u8>,
    /// Rejection reason given by the consumer
    pub reason: String,
    /// Queue the message was rejected from
    pub source_queue: String,
    /// Routing key the message was originally published with
    pub routing_key: String,
    /// Event type header of the message
    pub event_type: String,
    /// When the broker dead-lettered it
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Deliveries before it was rejected
    pub delivery_count: u32,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DeathHeader {
    queue: String,
    routing_key: String,
    reason: String,
    count: u32,
    time: Option<String>,
}

impl DeadLetterRecord {
    /// Decode a DLQ delivery; missing `x-death` fields are left empty.
    #[must_use]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let death = delivery
            .event
            .header(X_DEATH_HEADER)
            .cloned()
            .and_then(|header| serde_json::from_value::<DeathHeader>(header).ok())
            .unwrap_or_default();

        let dead_lettered_at = death
            .time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Self {
            payload: delivery.event.data.clone(),
            reason: death.reason,
            source_queue: death.queue,
            routing_key: death.routing_key,
            event_type: delivery.event.event_type.clone(),
            dead_lettered_at,
            delivery_count: death.count,
        }
    }

    /// Body as lossy UTF-8
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Reads and drains a dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterInspector {
    bus: Arc<dyn EventBus>,
    queue: String,
}

impl DeadLetterInspector {
    /// Inspector over `order.placed.dlq`
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::for_queue(bus, ORDER_PLACED_DLQ)
    }

    /// Inspector over any dead-letter queue
    #[must_use]
    pub fn for_queue(bus: Arc<dyn EventBus>, queue: impl Into<String>) -> Self {
        Self {
            bus,
            queue: queue.into(),
        }
    }

    /// Number of dead letters waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the DLQ was not declared.
    pub async fn count(&self) -> Result<usize, EventBusError> {
        self.bus.message_count(&self.queue).await
    }

    /// Remove up to `max` dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable or the DLQ was not
    /// declared. Records taken before the error are acknowledged already.
    pub async fn take(&self, max: usize) -> Result<Vec<DeadLetterRecord>, EventBusError> {
        let mut records = Vec::new();
        while records.len() < max {
            let Some(delivery) = self.bus.get(&self.queue).await? else {
                break;
            };
            let record = DeadLetterRecord::from_delivery(&delivery);
            delivery.ack().await?;

            tracing::info!(
                queue = %self.queue,
                source_queue = %record.source_queue,
                reason = %record.reason,
                "Dead letter taken"
            );
            records.push(record);
        }
        Ok(records)
    }
}
