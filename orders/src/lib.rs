//! Campus food ordering: an event-driven order-fulfillment workflow.
//!
//! Order Intake stores an order and publishes `OrderPlaced`; everything
//! downstream happens asynchronously through the broker:
//!
//! ```text
//!  client ──► Order Intake ──► order.placed ──► Inventory Reservation
//!                 ▲                                   │
//!                 │                  inventory.reserved / inventory.failed
//!                 │                                   │
//!                 │            ┌──────────────────────┼───────────────────┐
//!                 │            ▼                      ▼                   ▼
//!                 └─── Status Callback ◄──────────────┘     Notification Dispatch
//!
//!  rejected order.placed messages ──► order.placed.dlq (offline inspection)
//! ```
//!
//! # Delivery guarantees
//!
//! - Placing an order returns once the broker accepted `OrderPlaced`; it
//!   never waits for inventory, notification or callback.
//! - Stock is decremented, and the outcome event emitted, at most once per
//!   order id, however often `OrderPlaced` is delivered and however many
//!   inventory workers run. A publish that failed is retried on redelivery,
//!   so every decided order eventually gets its outcome event.
//! - Malformed `OrderPlaced` messages are dead-lettered exactly once and
//!   never block the messages behind them.
//! - Notifications are best effort and never affect an order's status.
//!
//! # Modules
//!
//! - [`types`], [`events`]: domain values and wire events
//! - [`aggregates`]: the order and inventory reducers
//! - [`app`]: Order Intake and Inventory Reservation services
//! - [`notification`], [`dead_letter`]: confirmation delivery and DLQ inspection
//! - [`topology`]: routing keys, queues and bindings
//! - [`runtime`]: consumers, handlers and lifecycle
//! - [`config`]: environment configuration

pub mod aggregates;
pub mod app;
pub mod config;
pub mod dead_letter;
pub mod events;
pub mod notification;
pub mod runtime;
pub mod topology;
pub mod types;

pub use app::{IntakeError, InventoryService, OrderIntake, PlaceOrderRequest};
pub use config::Config;
pub use runtime::{Application, ApplicationError, RunningApplication};
pub use types::{LineItem, Order, OrderId, OrderStatus, StudentId};
