//! Core domain types for campus food ordering.
//!
//! Orders progress through: Placed → (Reserved | Failed). Both outcomes are
//! terminal.

use chrono::{DateTime, Utc};
use campus_orders_core::environment::{Clock, IdGenerator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for an order
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Creates a new `OrderId` from a string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the student placing an order
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(String);

impl StudentId {
    /// Student id used when a request does not carry one
    pub const ANONYMOUS: &'static str = "anonymous";

    /// Creates a new `StudentId` from a string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The anonymous student
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS)
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Menu item identifier (e.g. `Pizza`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Creates a new `ItemId` from a string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single line of an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Item ordered
    pub item_id: ItemId,
    /// Quantity ordered
    pub qty: u32,
}

impl LineItem {
    /// Creates a new line item
    #[must_use]
    pub fn new(item_id: impl Into<String>, qty: u32) -> Self {
        Self {
            item_id: ItemId::new(item_id),
            qty,
        }
    }
}

/// Status of an order in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted by intake, reservation pending
    Placed,
    /// Stock was reserved
    Reserved,
    /// Reservation failed
    Failed,
}

impl OrderStatus {
    /// Reserved and Failed never change again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Reserved | Self::Failed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placed => write!(f, "PLACED"),
            Self::Reserved => write!(f, "RESERVED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// An order as stored by Order Intake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Student who placed the order
    pub student_id: StudentId,
    /// Ordered items
    pub items: Vec<LineItem>,
    /// Current status
    pub status: OrderStatus,
    /// Why the reservation failed (only for `Failed`)
    pub failure_reason: Option<String>,
    /// When the order was placed
    pub created_at: DateTime<Utc>,
    /// When the status last changed
    pub updated_at: DateTime<Utc>,
}

/// Generates order ids of the form `ORD-<millis mod 1_000_000>-<6 hex chars>`.
#[derive(Clone)]
pub struct OrderIdGenerator {
    clock: Arc<dyn Clock>,
}

impl OrderIdGenerator {
    /// Creates a generator reading time from `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdGenerator for OrderIdGenerator {
    fn next_id(&self) -> String {
        let millis = self.clock.now().timestamp_millis().rem_euclid(1_000_000);
        let suffix: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect();
        format!("ORD-{millis}-{suffix}")
    }
}
