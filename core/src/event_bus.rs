//! Event bus abstraction for service-to-service messaging.
//!
//! This module provides the [`EventBus`] trait: a broker with a topic exchange,
//! durable FIFO queues and explicit consumer acknowledgement. Services publish
//! events under a routing key; every queue bound to a matching pattern receives
//! its own copy (fan-out), and each queue is drained by its consumers in order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  order.placed   ┌──────────────┐
//! │ Order Intake │────────────────►│ order_placed │──► Inventory Reservation
//! └──────────────┘                 └──────┬───────┘
//!                                         │ reject (no requeue)
//!                                         ▼
//!                                  ┌──────────────────┐
//!                                  │ order.placed.dlq │  (inspection only)
//!                                  └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: A delivery stays in flight until it is settled.
//!   Unsettled deliveries return to the head of their queue when the consumer
//!   goes away, so they may be delivered more than once.
//! - **Idempotency**: Consumers must tolerate duplicate deliveries.
//! - **FIFO per queue**: Messages are delivered in publish order; a backlog
//!   built up while no consumer is attached drains in the same order.
//! - **Dead-lettering**: Rejected deliveries move to the queue's dead-letter
//!   queue (when one is configured) instead of being retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use campus_orders_core::event_bus::{EventBus, QueueSpec};
//! use campus_orders_core::event::SerializedEvent;
//! use futures::StreamExt;
//!
//! async fn example(bus: impl EventBus) -> Result<(), EventBusError> {
//!     bus.declare_queue(&QueueSpec::new("order_placed").with_dead_letter("order.placed.dlq")).await?;
//!     bus.bind_queue("order_placed", "order.placed").await?;
//!
//!     bus.publish("order.placed", &SerializedEvent::raw(r#"{"order_id":"ORD-1"}"#)).await?;
//!
//!     let mut deliveries = bus.subscribe("order_placed").await?;
//!     while let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         // process, then settle
//!         delivery.ack().await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::SerializedEvent;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible bus traits.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event
    #[error("Publish failed for routing key '{topic}': {reason}")]
    PublishFailed {
        /// The routing key that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The named queue has not been declared
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The delivery was already settled or belongs to another queue
    #[error("Unknown delivery tag {tag} on queue '{queue}'")]
    UnknownDelivery {
        /// Queue the settlement was addressed to
        queue: String,
        /// Delivery tag that was not in flight
        tag: u64,
    },

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

/// Declaration of a durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Queue that receives rejected deliveries (routed through the default
    /// direct exchange, so this is the dead-letter queue's name)
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// Declare a plain durable queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_routing_key: None,
        }
    }

    /// Route rejected deliveries to the named dead-letter queue.
    #[must_use]
    pub fn with_dead_letter(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processing finished; remove the message.
    Ack,
    /// Processing failed transiently; return the message to the head of the queue.
    Requeue,
    /// The message can never be processed; dead-letter it (or drop it when the
    /// queue has no dead-letter queue).
    Reject {
        /// Why the message was rejected (recorded in the `x-death` header)
        reason: String,
    },
}

/// Settles in-flight deliveries. Implemented by broker back-ends.
pub trait Acknowledger: Send + Sync {
    /// Settle the delivery identified by `tag` on `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownDelivery`] if the delivery is not in flight.
    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> BusFuture<'_, ()>;
}

/// A message handed to a consumer, awaiting settlement.
pub struct Delivery {
    /// Broker-assigned tag, unique per queue
    pub delivery_tag: u64,
    /// Queue the message was consumed from
    pub queue: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message body and headers
    pub event: SerializedEvent,
    /// True if this message was delivered before and not acknowledged
    pub redelivered: bool,
    /// How many times this message has been handed out (1 on first delivery)
    pub delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery bound to the acknowledger that issued it.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        queue: String,
        routing_key: String,
        event: SerializedEvent,
        delivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            queue,
            routing_key,
            event,
            redelivered: delivery_count > 1,
            delivery_count,
            acker,
        }
    }

    /// Settle this delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled.
    pub async fn settle(&self, settlement: Settlement) -> Result<(), EventBusError> {
        self.acker
            .settle(&self.queue, self.delivery_tag, settlement)
            .await
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled.
    pub async fn ack(&self) -> Result<(), EventBusError> {
        self.settle(Settlement::Ack).await
    }

    /// Return the message to its queue for another attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled.
    pub async fn requeue(&self) -> Result<(), EventBusError> {
        self.settle(Settlement::Requeue).await
    }

    /// Reject the message permanently (negative acknowledgement without requeue).
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled.
    pub async fn reject(&self, reason: impl Into<String>) -> Result<(), EventBusError> {
        self.settle(Settlement::Reject {
            reason: reason.into(),
        })
        .await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("event", &self.event)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a queue subscription.
///
/// Dropping the stream ends the subscription; deliveries it handed out that
/// were never settled go back to the queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to support concurrent access
/// from several consumers and effect executors.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`). The returned futures
/// borrow only `self`, so implementations copy their arguments up front.
pub trait EventBus: Send + Sync {
    /// Declare a durable queue. Declaring an existing queue keeps its contents.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the broker is unreachable.
    fn declare_queue(&self, spec: &QueueSpec) -> BusFuture<'_, ()>;

    /// Bind a queue to a routing-key pattern (`*` = one word, `#` = any words).
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the queue was not declared.
    fn bind_queue(&self, queue: &str, pattern: &str) -> BusFuture<'_, ()>;

    /// Publish an event under a routing key.
    ///
    /// Returns once the broker has enqueued a copy in every bound queue; it
    /// never waits for consumers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] or
    /// [`EventBusError::ConnectionFailed`] if the broker did not accept it.
    fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()>;

    /// Subscribe to a queue and receive its deliveries in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the queue was not declared,
    /// or [`EventBusError::ConnectionFailed`] if the broker is unreachable.
    fn subscribe(&self, queue: &str) -> BusFuture<'_, DeliveryStream>;

    /// Pull the head message of a queue, if any (it must still be settled).
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the queue was not declared.
    fn get(&self, queue: &str) -> BusFuture<'_, Option<Delivery>>;

    /// Number of messages waiting in a queue (excluding in-flight deliveries).
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the queue was not declared.
    fn message_count(&self, queue: &str) -> BusFuture<'_, usize>;
}
