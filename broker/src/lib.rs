//! In-memory broker for the campus order workflow.
//!
//! This crate provides [`InMemoryBroker`], an implementation of the
//! [`EventBus`] trait from `campus-orders-core` that behaves like a single
//! topic exchange in front of durable queues:
//!
//! - **Fan-out**: every queue bound to a matching pattern gets its own copy
//! - **FIFO**: each queue hands out messages in publish order
//! - **Backlog**: messages published while nobody consumes stay queued
//! - **Explicit acknowledgement**: a delivery stays in flight until settled;
//!   deliveries of a dropped subscription return to the head of the queue
//! - **Prefetch 1**: a subscription receives its next message only after it
//!   settled the previous one
//! - **Dead-lettering**: rejected messages move to the queue named by the
//!   source queue's dead-letter routing key, with an `x-death` header
//!
//! Durability is process-wide: queues outlive their consumers but not the
//! process.
//!
//! # Example
//!
//! ```
//! use campus_orders_broker::InMemoryBroker;
//! use campus_orders_core::event::SerializedEvent;
//! use campus_orders_core::event_bus::{EventBus, QueueSpec};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::builder().exchange("orders_exchange").build();
//!
//! broker.declare_queue(&QueueSpec::new("inventory_reserved")).await?;
//! broker.bind_queue("inventory_reserved", "inventory.reserved").await?;
//! broker.publish("inventory.reserved", &SerializedEvent::raw(r#"{"order_id":"ORD-1"}"#)).await?;
//!
//! let mut deliveries = broker.subscribe("inventory_reserved").await?;
//! if let Some(delivery) = deliveries.next().await {
//!     delivery?.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use campus_orders_core::event::SerializedEvent;
use campus_orders_core::event_bus::{
    Acknowledger, BusFuture, Delivery, DeliveryStream, EventBus, EventBusError, QueueSpec,
    Settlement,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

mod queue;
pub mod topic;

use queue::{Holder, Message, QueueState};
use topic::TopicPattern;

/// Header added to dead-lettered messages.
pub const X_DEATH_HEADER: &str = "x-death";

/// In-memory topic-exchange broker.
///
/// Cloning is cheap; clones share the same exchange and queues.
///
/// # Example
///
/// ```
/// use campus_orders_broker::InMemoryBroker;
///
/// let broker = InMemoryBroker::builder()
///     .exchange("orders_exchange")
///     .build();
/// assert_eq!(broker.exchange(), "orders_exchange");
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    exchange: String,
    state: Mutex<BrokerState>,
    available: AtomicBool,
    next_consumer: AtomicU64,
    /// Bumped on every change a waiting consumer could care about
    changes: watch::Sender<u64>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, TopicPattern)>,
}

impl InMemoryBroker {
    /// Create a broker with the default exchange name (`orders_exchange`).
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> InMemoryBrokerBuilder {
        InMemoryBrokerBuilder::default()
    }

    /// Name of the topic exchange.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    ///
    /// While unavailable, declare/bind/publish/subscribe/get/settle fail with
    /// [`EventBusError::ConnectionFailed`], and open subscriptions end after
    /// yielding that error; their unsettled deliveries go back to the queue.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was != available {
            if available {
                tracing::info!(exchange = %self.inner.exchange, "Broker available");
            } else {
                tracing::warn!(exchange = %self.inner.exchange, "Broker unavailable");
            }
            self.inner.notify_change();
        }
    }

    /// Whether the broker currently accepts operations.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Number of deliveries handed out and not yet settled.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownQueue`] if the queue was not declared.
    pub fn in_flight_count(&self, queue: &str) -> Result<usize, EventBusError> {
        let state = self.inner.lock()?;
        state
            .queues
            .get(queue)
            .map(QueueState::in_flight_len)
            .ok_or_else(|| EventBusError::UnknownQueue(queue.to_string()))
    }

    /// Names of all declared queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .map(|s| s.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("exchange", &self.inner.exchange)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

/// Builder for [`InMemoryBroker`].
#[derive(Debug, Default)]
pub struct InMemoryBrokerBuilder {
    exchange: Option<String>,
}

impl InMemoryBrokerBuilder {
    /// Set the topic exchange name (used in logs only).
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Build the broker.
    #[must_use]
    pub fn build(self) -> InMemoryBroker {
        let (changes, _) = watch::channel(0);
        InMemoryBroker {
            inner: Arc::new(BrokerInner {
                exchange: self
                    .exchange
                    .unwrap_or_else(|| "orders_exchange".to_string()),
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                next_consumer: AtomicU64::new(1),
                changes,
            }),
        }
    }
}

impl BrokerInner {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, EventBusError> {
        self.state
            .lock()
            .map_err(|e| EventBusError::Other(format!("broker state poisoned: {e}")))
    }

    fn ensure_available(&self) -> Result<(), EventBusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventBusError::ConnectionFailed(format!(
                "broker for exchange '{}' is unavailable",
                self.exchange
            )))
        }
    }

    fn notify_change(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn declare(&self, spec: QueueSpec) -> Result<(), EventBusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec != spec {
                tracing::warn!(
                    queue = %spec.name,
                    "Queue already declared with different arguments, keeping the original"
                );
            }
            return Ok(());
        }
        tracing::debug!(queue = %spec.name, dead_letter = ?spec.dead_letter_routing_key, "Declared queue");
        state.queues.insert(spec.name.clone(), QueueState::new(spec));
        Ok(())
    }

    fn bind(&self, queue: &str, pattern: &str) -> Result<(), EventBusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        if !state.queues.contains_key(queue) {
            return Err(EventBusError::UnknownQueue(queue.to_string()));
        }
        let exists = state
            .bindings
            .iter()
            .any(|(q, p)| q == queue && p.as_str() == pattern);
        if !exists {
            state
                .bindings
                .push((queue.to_string(), TopicPattern::new(pattern)));
            tracing::debug!(exchange = %self.exchange, queue, pattern, "Bound queue");
        }
        Ok(())
    }

    fn route(&self, routing_key: &str, event: &SerializedEvent) -> Result<usize, EventBusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, pattern) in &state.bindings {
            if pattern.matches(routing_key) && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.enqueue(Message {
                    routing_key: routing_key.to_string(),
                    event: event.clone(),
                    delivery_count: 0,
                });
            }
        }
        drop(state);

        if targets.is_empty() {
            tracing::warn!(exchange = %self.exchange, routing_key, "Unroutable message dropped");
        } else {
            tracing::debug!(
                exchange = %self.exchange,
                routing_key,
                queues = ?targets,
                event_type = %event.event_type,
                "Message routed"
            );
            self.notify_change();
        }
        Ok(targets.len())
    }

    fn next_delivery(
        self: &Arc<Self>,
        queue: &str,
        holder: Holder,
    ) -> Result<Option<Delivery>, EventBusError> {
        let mut state = self.lock()?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| EventBusError::UnknownQueue(queue.to_string()))?;

        if let Holder::Consumer(consumer) = holder {
            if entry.holds_unsettled(consumer) {
                return Ok(None);
            }
        }

        Ok(entry.take_next(holder).map(|(tag, message)| {
            let acker: Arc<dyn Acknowledger> = Arc::clone(self) as Arc<dyn Acknowledger>;
            Delivery::new(
                tag,
                queue.to_string(),
                message.routing_key,
                message.event,
                message.delivery_count,
                acker,
            )
        }))
    }

    fn settle_now(
        &self,
        queue: &str,
        tag: u64,
        settlement: Settlement,
    ) -> Result<(), EventBusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| EventBusError::UnknownQueue(queue.to_string()))?;
        let message = entry.settle(tag).ok_or_else(|| EventBusError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        })?;

        match settlement {
            Settlement::Ack => {
                tracing::trace!(queue, delivery_tag = tag, "Acked");
            },
            Settlement::Requeue => {
                tracing::debug!(queue, delivery_tag = tag, "Requeued");
                entry.requeue_front(message);
            },
            Settlement::Reject { reason } => {
                let dead_letter = entry.spec.dead_letter_routing_key.clone();
                Self::dead_letter(&mut state, queue, dead_letter, message, &reason);
            },
        }
        drop(state);

        self.notify_change();
        Ok(())
    }

    fn dead_letter(
        state: &mut BrokerState,
        queue: &str,
        dead_letter: Option<String>,
        message: Message,
        reason: &str,
    ) {
        let Some(target) = dead_letter else {
            tracing::warn!(queue, reason, "Rejected message discarded (no dead-letter queue)");
            return;
        };

        let Some(dlq) = state.queues.get_mut(&target) else {
            tracing::warn!(
                queue,
                dead_letter_queue = %target,
                reason,
                "Dead-letter queue not declared, rejected message discarded"
            );
            return;
        };

        let mut event = message.event;
        event.set_header(
            X_DEATH_HEADER,
            serde_json::json!({
                "queue": queue,
                "routing_key": message.routing_key,
                "reason": reason,
                "count": message.delivery_count,
                "time": Utc::now().to_rfc3339(),
            }),
        );
        dlq.enqueue(Message {
            routing_key: target.clone(),
            event,
            delivery_count: 0,
        });

        metrics::counter!("dlq.routed", "queue" => queue.to_string()).increment(1);
        tracing::warn!(queue, dead_letter_queue = %target, reason, "Message dead-lettered");
    }
}

impl Acknowledger for BrokerInner {
    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> BusFuture<'_, ()> {
        let result = self.settle_now(queue, tag, settlement);
        Box::pin(async move { result })
    }
}

/// Returns a subscription's unsettled deliveries to its queue when dropped.
struct ConsumerGuard {
    inner: Arc<BrokerInner>,
    queue: String,
    consumer: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let released = match self.inner.state.lock() {
            Ok(mut state) => state
                .queues
                .get_mut(&self.queue)
                .map_or(0, |q| q.release_consumer(self.consumer)),
            Err(_) => 0,
        };
        if released > 0 {
            tracing::info!(
                queue = %self.queue,
                consumer = self.consumer,
                released,
                "Consumer gone, unsettled deliveries requeued"
            );
            self.inner.notify_change();
        }
    }
}

impl EventBus for InMemoryBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> BusFuture<'_, ()> {
        let result = self.inner.declare(spec.clone());
        Box::pin(async move { result })
    }

    fn bind_queue(&self, queue: &str, pattern: &str) -> BusFuture<'_, ()> {
        let result = self.inner.bind(queue, pattern);
        Box::pin(async move { result })
    }

    fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
        let result = self.inner.route(topic, event).map(|_| ());
        Box::pin(async move { result })
    }

    fn subscribe(&self, queue: &str) -> BusFuture<'_, DeliveryStream> {
        let queue = queue.to_string();
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            inner.ensure_available()?;
            if !inner.lock()?.queues.contains_key(&queue) {
                return Err(EventBusError::UnknownQueue(queue));
            }

            let consumer = inner.next_consumer.fetch_add(1, Ordering::SeqCst);
            tracing::info!(queue = %queue, consumer, "Consumer attached");

            let stream = async_stream::stream! {
                let mut changes = inner.changes.subscribe();
                let _guard = ConsumerGuard {
                    inner: Arc::clone(&inner),
                    queue: queue.clone(),
                    consumer,
                };

                loop {
                    changes.borrow_and_update();

                    if let Err(error) = inner.ensure_available() {
                        yield Err(error);
                        break;
                    }

                    match inner.next_delivery(&queue, Holder::Consumer(consumer)) {
                        Ok(Some(delivery)) => yield Ok(delivery),
                        Ok(None) => {
                            if changes.changed().await.is_err() {
                                break;
                            }
                        },
                        Err(error) => {
                            yield Err(error);
                            break;
                        },
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn get(&self, queue: &str) -> BusFuture<'_, Option<Delivery>> {
        let result = self
            .inner
            .ensure_available()
            .and_then(|()| self.inner.next_delivery(queue, Holder::Pull));
        Box::pin(async move { result })
    }

    fn message_count(&self, queue: &str) -> BusFuture<'_, usize> {
        let result = self.inner.lock().and_then(|state| {
            state
                .queues
                .get(queue)
                .map(QueueState::ready_len)
                .ok_or_else(|| EventBusError::UnknownQueue(queue.to_string()))
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InMemoryBroker>();
    }

    #[tokio::test]
    async fn publish_without_binding_is_dropped() {
        let broker = InMemoryBroker::new();
        assert!(broker.declare_queue(&QueueSpec::new("q")).await.is_ok());
        assert!(broker.publish("nobody.listens", &SerializedEvent::raw("x")).await.is_ok());
        assert_eq!(broker.message_count("q").await, Ok(0));
    }

    #[tokio::test]
    async fn bind_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        assert_eq!(
            broker.bind_queue("missing", "order.placed").await,
            Err(EventBusError::UnknownQueue("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn redeclare_keeps_contents() {
        let broker = InMemoryBroker::new();
        let spec = QueueSpec::new("q");
        assert!(broker.declare_queue(&spec).await.is_ok());
        assert!(broker.bind_queue("q", "a.b").await.is_ok());
        assert!(broker.publish("a.b", &SerializedEvent::raw("1")).await.is_ok());
        assert!(broker.declare_queue(&spec).await.is_ok());
        assert_eq!(broker.message_count("q").await, Ok(1));
        assert_eq!(broker.queue_names(), vec!["q".to_string()]);
    }
}
