//! Events exchanged between the workflow services.
//!
//! All events travel as JSON. Producers serialize the typed structs below;
//! consumers decode with [`OrderPlaced::decode`] and friends, which add the
//! structural checks that decide whether a message is processable at all.
//! A message that fails them is poison: it is rejected, never retried.

use crate::topology;
use crate::types::{ItemId, LineItem, OrderId, OrderStatus, StudentId};
use campus_orders_core::event::{Event, EventError, SerializedEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wrap a typed event in a broker message with JSON content headers.
///
/// # Errors
///
/// Returns `EventError::SerializationError` if the event cannot be serialized.
pub fn to_message<E: Event + Serialize>(event: &E) -> Result<SerializedEvent, EventError> {
    SerializedEvent::from_event(
        event,
        Some(serde_json::json!({ "content_type": "application/json" })),
    )
}

fn malformed(reason: impl Into<String>) -> EventError {
    EventError::DeserializationError(reason.into())
}

fn require_order_id(order_id: &OrderId) -> Result<(), EventError> {
    if order_id.as_str().trim().is_empty() {
        return Err(malformed("order_id must not be blank"));
    }
    Ok(())
}

/// An order was accepted by Order Intake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order identifier
    pub order_id: OrderId,
    /// Student who placed the order
    pub student_id: StudentId,
    /// Ordered items
    pub items: Vec<LineItem>,
}

impl Event for OrderPlaced {
    fn event_type(&self) -> &'static str {
        "OrderPlaced.v1"
    }
}

/// Lenient wire shape, so a missing field is reported by name instead of
/// as a generic serde error.
#[derive(Deserialize)]
struct OrderPlacedWire {
    order_id: Option<String>,
    student_id: Option<String>,
    items: Option<Vec<LineItemWire>>,
}

#[derive(Deserialize)]
struct LineItemWire {
    item_id: Option<String>,
    qty: Option<u32>,
}

impl OrderPlaced {
    /// Decode and structurally validate an `OrderPlaced` message.
    ///
    /// A missing `student_id` decodes as the anonymous student.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` when the body is not JSON
    /// of the expected shape, `order_id` is missing or blank, `items` is
    /// missing or empty, or any item has a blank id or a zero quantity.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let wire: OrderPlacedWire = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;

        let order_id = OrderId::new(wire.order_id.ok_or_else(|| malformed("missing order_id"))?);
        require_order_id(&order_id)?;

        let wire_items = wire.items.ok_or_else(|| malformed("missing items"))?;
        if wire_items.is_empty() {
            return Err(malformed("items must not be empty"));
        }

        let items = wire_items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let item_id = item
                    .item_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| malformed(format!("items[{index}] has no item_id")))?;
                match item.qty {
                    Some(qty) if qty > 0 => Ok(LineItem::new(item_id, qty)),
                    Some(_) => Err(malformed(format!("items[{index}] has zero qty"))),
                    None => Err(malformed(format!("items[{index}] has no qty"))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            order_id,
            student_id: wire.student_id.map_or_else(StudentId::anonymous, StudentId::new),
            items,
        })
    }
}

/// Stock was reserved for an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReserved {
    /// Order identifier
    pub order_id: OrderId,
    /// Reserved items
    #[serde(default)]
    pub items: Vec<LineItem>,
    /// Stock left per reserved item after the reservation
    #[serde(default)]
    pub remaining: BTreeMap<ItemId, u32>,
}

impl Event for InventoryReserved {
    fn event_type(&self) -> &'static str {
        "InventoryReserved.v1"
    }
}

impl InventoryReserved {
    /// Decode an `InventoryReserved` message; only `order_id` is required.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the body is not JSON or
    /// `order_id` is missing or blank.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let event = Self::from_bytes(bytes)?;
        require_order_id(&event.order_id)?;
        Ok(event)
    }
}

fn unknown_reason() -> String {
    "unknown".to_string()
}

/// Stock could not be reserved for an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFailed {
    /// Order identifier
    pub order_id: OrderId,
    /// Why the reservation failed
    #[serde(default = "unknown_reason")]
    pub reason: String,
    /// Items that were requested
    #[serde(default)]
    pub items: Vec<LineItem>,
}

impl Event for InventoryFailed {
    fn event_type(&self) -> &'static str {
        "InventoryFailed.v1"
    }
}

impl InventoryFailed {
    /// Decode an `InventoryFailed` message; a missing reason reads as `unknown`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the body is not JSON or
    /// `order_id` is missing or blank.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let event = Self::from_bytes(bytes)?;
        require_order_id(&event.order_id)?;
        Ok(event)
    }
}

/// The decided result of a reservation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// Stock was reserved
    Reserved(InventoryReserved),
    /// Stock was insufficient
    Failed(InventoryFailed),
}

impl ReservationOutcome {
    /// Order this outcome belongs to
    #[must_use]
    pub const fn order_id(&self) -> &OrderId {
        match self {
            Self::Reserved(event) => &event.order_id,
            Self::Failed(event) => &event.order_id,
        }
    }

    /// Routing key the outcome is published under
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Reserved(_) => topology::INVENTORY_RESERVED,
            Self::Failed(_) => topology::INVENTORY_FAILED,
        }
    }

    /// Order status this outcome leads to
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        match self {
            Self::Reserved(_) => OrderStatus::Reserved,
            Self::Failed(_) => OrderStatus::Failed,
        }
    }

    /// Serialize the outcome for publishing.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if serialization fails.
    pub fn to_message(&self) -> Result<SerializedEvent, EventError> {
        match self {
            Self::Reserved(event) => to_message(event),
            Self::Failed(event) => to_message(event),
        }
    }
}
