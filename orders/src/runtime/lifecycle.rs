//! Application lifecycle management and graceful shutdown.
//!
//! 1. **Startup**: declare the topology, build the stores, spawn one
//!    consumer per queue (several for `order_placed` when configured)
//! 2. **Runtime**: consumers process deliveries; callers use the handles
//!    on [`RunningApplication`]
//! 3. **Shutdown**: broadcast the signal, join every consumer (bounded by
//!    the shutdown timeout), then drain the stores
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Application::new(config, event_bus).start().await?;
//!
//! let order_id = app.intake().place_order(request).await?;
//!
//! app.run_until_signal().await?;
//! ```

use crate::aggregates::{
    InventoryEnvironment, InventoryReducer, InventoryState, OrderEnvironment, OrderReducer,
    OrderState, RandomSource, ThreadRandom,
};
use crate::app::{IntakeError, InventoryService, OrderIntake};
use crate::config::Config;
use crate::dead_letter::DeadLetterInspector;
use crate::notification::{LogNotifier, NotificationLog, Notifier};
use crate::runtime::consumer::ConsumerError;
use crate::runtime::handlers::{InventoryHandler, NotificationHandler, StatusCallbackHandler};
use crate::runtime::{EventConsumer, EventHandler};
use crate::topology::{
    self, CALLBACK_FAILED_QUEUE, CALLBACK_RESERVED_QUEUE, INVENTORY_RESERVED_QUEUE,
    ORDER_PLACED_QUEUE,
};
use crate::types::OrderIdGenerator;
use campus_orders_core::environment::{Clock, IdGenerator, SystemClock};
use campus_orders_core::event_bus::{EventBus, EventBusError};
use campus_orders_runtime::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors starting or stopping the application
#[derive(Error, Debug)]
pub enum ApplicationError {
    /// The broker rejected the topology
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// A consumer could not be built
    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    /// Order Intake did not shut down cleanly
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    /// The inventory store did not shut down cleanly
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A configured application, not yet started.
///
/// Clock, id generator, notifier and randomness default to their production
/// implementations and can be replaced for tests.
pub struct Application {
    config: Config,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    notifier: Option<Arc<dyn Notifier>>,
    random: Arc<dyn RandomSource>,
}

impl Application {
    /// Create an application over `event_bus`.
    #[must_use]
    pub fn new(config: Config, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            event_bus,
            clock: Arc::new(SystemClock),
            ids: None,
            notifier: None,
            random: Arc::new(ThreadRandom),
        }
    }

    /// Use a different clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different order id generator
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Deliver notifications through `notifier` instead of the log notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use a different randomness source for random availability
    #[must_use]
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Declare the topology and spawn all consumers.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::EventBus`] if the topology could not be
    /// declared within the publish retry policy.
    pub async fn start(self) -> Result<RunningApplication, ApplicationError> {
        let config = self.config;
        let retry_policy = config.retry_policy();

        topology::declare(self.event_bus.as_ref(), &retry_policy).await?;
        info!("Broker topology declared");

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(OrderIdGenerator::new(Arc::clone(&self.clock))));
        let intake = OrderIntake::new(
            Store::with_retry_policy(
                OrderState::new(),
                OrderReducer::new(),
                OrderEnvironment::new(Arc::clone(&self.clock), Arc::clone(&self.event_bus)),
                retry_policy.clone(),
            ),
            ids,
            config.intake.publish_timeout,
        );

        let inventory = InventoryService::new(Store::with_retry_policy(
            InventoryState::with_stock(config.inventory.stock.clone()),
            InventoryReducer::new(),
            InventoryEnvironment::new(Arc::clone(&self.event_bus))
                .with_availability(config.inventory.availability, self.random),
            retry_policy,
        ));

        let notifications = NotificationLog::new();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier::new(notifications.clone())));

        let (shutdown_tx, _) = broadcast::channel(1);
        let consumer = |name: String, queue: &str, handler: Arc<dyn EventHandler>| {
            EventConsumer::builder()
                .name(name)
                .queue(queue)
                .event_bus(Arc::clone(&self.event_bus))
                .handler(handler)
                .shutdown(shutdown_tx.subscribe())
                .retry_delay(config.consumer.retry_delay)
                .build()
        };

        let mut consumers = Vec::new();
        for worker in 0..config.inventory.workers.max(1) {
            consumers.push(consumer(
                format!("inventory-{worker}"),
                ORDER_PLACED_QUEUE,
                Arc::new(InventoryHandler::new(inventory.clone())),
            )?);
        }
        consumers.push(consumer(
            "notification".to_string(),
            INVENTORY_RESERVED_QUEUE,
            Arc::new(NotificationHandler::new(
                notifier,
                Arc::clone(&self.clock),
                config.notification.timeout,
            )),
        )?);
        consumers.push(consumer(
            "callback-reserved".to_string(),
            CALLBACK_RESERVED_QUEUE,
            Arc::new(StatusCallbackHandler::reserved(intake.clone())),
        )?);
        consumers.push(consumer(
            "callback-failed".to_string(),
            CALLBACK_FAILED_QUEUE,
            Arc::new(StatusCallbackHandler::failed(intake.clone())),
        )?);

        info!(consumer_count = consumers.len(), "Starting event consumers");
        let handles = consumers
            .into_iter()
            .map(|consumer| (consumer.name().to_string(), consumer.spawn()))
            .collect();

        Ok(RunningApplication {
            intake,
            inventory,
            notifications,
            dead_letters: DeadLetterInspector::new(Arc::clone(&self.event_bus)),
            shutdown_tx,
            handles,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// A started application.
pub struct RunningApplication {
    intake: OrderIntake,
    inventory: InventoryService,
    notifications: NotificationLog,
    dead_letters: DeadLetterInspector,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl RunningApplication {
    /// Order Intake
    #[must_use]
    pub const fn intake(&self) -> &OrderIntake {
        &self.intake
    }

    /// Inventory Reservation
    #[must_use]
    pub const fn inventory(&self) -> &InventoryService {
        &self.inventory
    }

    /// Notifications sent by the default log notifier
    #[must_use]
    pub const fn notifications(&self) -> &NotificationLog {
        &self.notifications
    }

    /// Dead-letter queue inspection
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterInspector {
        &self.dead_letters
    }

    /// Run until Ctrl+C or SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// See [`RunningApplication::shutdown`].
    pub async fn run_until_signal(self) -> Result<(), ApplicationError> {
        shutdown_signal().await;
        self.shutdown().await
    }

    /// Stop all consumers, then drain both stores.
    ///
    /// # Errors
    ///
    /// Returns an error if a store still had running effects at the timeout.
    pub async fn shutdown(self) -> Result<(), ApplicationError> {
        info!("Initiating graceful shutdown...");

        if self.shutdown_tx.send(()).is_err() {
            warn!("No consumer was listening for the shutdown signal");
        }
        Self::await_shutdown(self.handles, self.shutdown_timeout).await;

        self.intake.shutdown(self.shutdown_timeout).await?;
        self.inventory.shutdown(self.shutdown_timeout).await?;

        info!("Graceful shutdown complete");
        Ok(())
    }

    /// Wait for all consumers, giving each `timeout` to finish its current delivery.
    async fn await_shutdown(handles: Vec<(String, JoinHandle<()>)>, timeout: Duration) {
        for (name, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!(consumer = %name, "Consumer stopped gracefully"),
                Ok(Err(e)) => warn!(consumer = %name, error = %e, "Consumer task failed"),
                Err(_) => warn!(consumer = %name, "Consumer shutdown timed out"),
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
