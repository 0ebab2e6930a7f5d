//! Queue consumer with automatic reconnection.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe(queue):
//!         for each delivery (one at a time):
//!             handler.handle(delivery)
//!             settle: Ok → ack, Malformed → reject, Transient → requeue after retry_delay
//!     stream ended or broker unreachable:
//!         wait retry_delay, subscribe again
//! }
//! ```
//!
//! A failing message never stops the loop. Deliveries left unsettled when a
//! stream drops are returned to the queue by the broker, so a reconnecting
//! consumer resumes with the backlog in order.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::builder()
//!     .name("inventory-0")
//!     .queue(ORDER_PLACED_QUEUE)
//!     .event_bus(event_bus)
//!     .handler(Arc::new(InventoryHandler::new(service)))
//!     .shutdown(shutdown_tx.subscribe())
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use super::{EventHandler, HandlerError};
use campus_orders_core::event_bus::{Delivery, DeliveryStream, EventBus, EventBusError};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default delay before resubscribing or requeueing
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors building an [`EventConsumer`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A required builder field was not set
    #[error("Consumer field '{0}' is required")]
    MissingField(&'static str),
}

/// How a subscription ended
enum StreamEnd {
    Shutdown,
    Ended,
    Failed(EventBusError),
}

/// Consumer of one queue.
///
/// # Lifecycle
///
/// 1. Created via `builder()` or `new()`
/// 2. Spawned as background task via `spawn()`
/// 3. Runs until the shutdown signal is received
pub struct EventConsumer {
    /// Consumer name (for logging and monitoring)
    name: String,

    /// Queue to consume
    queue: String,

    /// Event bus to consume from
    event_bus: Arc<dyn EventBus>,

    /// Handler for processing deliveries
    handler: Arc<dyn EventHandler>,

    /// Shutdown signal receiver
    shutdown: broadcast::Receiver<()>,

    /// Delay before resubscribing and before requeueing a transient failure
    retry_delay: Duration,
}

impl EventConsumer {
    /// Create a consumer with the default retry delay (5 seconds).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        event_bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            event_bus,
            handler,
            shutdown,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consumer name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until the shutdown signal is received.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, queue = %self.queue, "Event consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.event_bus.subscribe(&self.queue) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, queue = %self.queue, "Subscribed to queue");

                            match self.process_stream(&mut stream).await {
                                StreamEnd::Shutdown => break,
                                StreamEnd::Ended => {
                                    warn!(
                                        consumer = %self.name,
                                        "Delivery stream ended, reconnecting in {:?}",
                                        self.retry_delay
                                    );
                                },
                                StreamEnd::Failed(e) => {
                                    error!(
                                        consumer = %self.name,
                                        error = %e,
                                        "Lost connection to broker, reconnecting in {:?}",
                                        self.retry_delay
                                    );
                                },
                            }
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to queue, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            if self.pause().await {
                break;
            }
        }

        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Sleep for the retry delay. Returns `true` if shutdown was signalled meanwhile.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.recv() => {
                info!(consumer = %self.name, "Event consumer received shutdown signal while waiting");
                true
            }
            () = tokio::time::sleep(self.retry_delay) => false,
        }
    }

    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> StreamEnd {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal during processing");
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => self.process(delivery).await,
                        Some(Err(e)) => return StreamEnd::Failed(e),
                        None => return StreamEnd::Ended,
                    }
                }
            }
        }
    }

    /// Handle one delivery and settle it.
    async fn process(&self, delivery: Delivery) {
        let settled = match self.handler.handle(&delivery).await {
            Ok(()) => delivery.ack().await,
            Err(HandlerError::Malformed(reason)) => {
                metrics::counter!("consumer.rejected", "queue" => self.queue.clone()).increment(1);
                warn!(
                    consumer = %self.name,
                    delivery_tag = delivery.delivery_tag,
                    payload = %delivery.event.preview(120),
                    reason = %reason,
                    "Rejecting malformed message"
                );
                delivery.reject(reason).await
            },
            Err(HandlerError::Transient(reason)) => {
                metrics::counter!("consumer.requeued", "queue" => self.queue.clone()).increment(1);
                warn!(
                    consumer = %self.name,
                    delivery_tag = delivery.delivery_tag,
                    reason = %reason,
                    "Transient failure, requeueing in {:?}",
                    self.retry_delay
                );
                tokio::time::sleep(self.retry_delay).await;
                delivery.requeue().await
            },
        };

        if let Err(e) = settled {
            error!(
                consumer = %self.name,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

/// Builder for configuring an `EventConsumer`.
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    queue: Option<String>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_delay: Option<Duration>,
}

impl EventConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the queue to consume.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set event bus instance.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set event handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set custom retry delay (default: 5 seconds).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build the `EventConsumer`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::MissingField`] if name, queue, event bus,
    /// handler or shutdown receiver is not set.
    pub fn build(self) -> Result<EventConsumer, ConsumerError> {
        Ok(EventConsumer {
            name: self.name.ok_or(ConsumerError::MissingField("name"))?,
            queue: self.queue.ok_or(ConsumerError::MissingField("queue"))?,
            event_bus: self.event_bus.ok_or(ConsumerError::MissingField("event_bus"))?,
            handler: self.handler.ok_or(ConsumerError::MissingField("handler"))?,
            shutdown: self.shutdown.ok_or(ConsumerError::MissingField("shutdown"))?,
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        })
    }
}
