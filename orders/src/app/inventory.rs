//! Inventory Reservation service over the inventory store.

use crate::aggregates::{
    InventoryAction, InventoryEnvironment, InventoryReducer, InventoryState, Publication, RegistryEntry,
};
use crate::events::OrderPlaced;
use crate::types::{ItemId, OrderId};
use campus_orders_runtime::{Store, StoreError};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

/// How long a duplicate waits for another worker's publish of the same outcome
pub const DEFAULT_IN_FLIGHT_WAIT: Duration = Duration::from_secs(30);

/// Store running the inventory reducer
pub type InventoryStore = Store<InventoryState, InventoryAction, InventoryEnvironment, InventoryReducer>;

/// Errors returned by [`InventoryService::reserve`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// The order was decided but the outcome event is not yet published
    #[error("Outcome for order {0} is not published yet")]
    Unpublished(OrderId),

    /// Another worker is still publishing the outcome of this order
    #[error("Outcome for order {0} is still being published")]
    InFlight(OrderId),

    /// The inventory store refused the command
    #[error("Inventory store error: {0}")]
    Store(#[from] StoreError),
}

/// Handle to Inventory Reservation, shared by every inventory consumer.
#[derive(Clone)]
pub struct InventoryService {
    store: InventoryStore,
    in_flight_wait: Duration,
}

impl InventoryService {
    /// Creates a service over an inventory store
    #[must_use]
    pub const fn new(store: InventoryStore) -> Self {
        Self {
            store,
            in_flight_wait: DEFAULT_IN_FLIGHT_WAIT,
        }
    }

    /// Bound how long a duplicate waits for a publish started by another call
    #[must_use]
    pub const fn with_in_flight_wait(mut self, wait: Duration) -> Self {
        self.in_flight_wait = wait;
        self
    }

    /// Reserve stock for an order and publish the outcome.
    ///
    /// Returns once the outcome (new or previously recorded) has been
    /// accepted by the broker. Duplicates of a published order return
    /// immediately without touching stock. A duplicate arriving while the
    /// outcome is being published emits nothing and waits for that publish.
    ///
    /// # Errors
    ///
    /// - [`ReserveError::Unpublished`] if publishing the outcome failed; the
    ///   outcome stays recorded and is published on the next attempt
    /// - [`ReserveError::InFlight`] if another publish of the outcome did not
    ///   settle in time
    /// - [`ReserveError::Store`] if the store is shutting down
    pub async fn reserve(&self, order: OrderPlaced) -> Result<(), ReserveError> {
        let order_id = order.order_id.clone();
        let feedback = self.store.subscribe_actions();
        let mut handle = self.store.send(InventoryAction::Reserve { order }).await?;
        handle.wait().await;

        match self.store.state(|s| s.registry.publication(&order_id)).await {
            Some(Publication::Published) => Ok(()),
            Some(Publication::InFlight) => self.await_publication(order_id, feedback).await,
            Some(Publication::Pending) | None => Err(ReserveError::Unpublished(order_id)),
        }
    }

    /// Wait for the feedback of a publish this call did not start
    async fn await_publication(
        &self,
        order_id: OrderId,
        mut feedback: broadcast::Receiver<InventoryAction>,
    ) -> Result<(), ReserveError> {
        let settled = tokio::time::timeout(self.in_flight_wait, async {
            loop {
                match feedback.recv().await {
                    Ok(InventoryAction::OutcomePublished { order_id: id }) if id == order_id => {
                        return Ok(());
                    },
                    Ok(InventoryAction::OutcomePublishFailed { order_id: id, .. }) if id == order_id => {
                        return Err(ReserveError::Unpublished(order_id.clone()));
                    },
                    Ok(_) => {},
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Inventory feedback lagged, checking the registry");
                        match self.store.state(|s| s.registry.publication(&order_id)).await {
                            Some(Publication::Published) => return Ok(()),
                            Some(Publication::InFlight) => {},
                            Some(Publication::Pending) | None => {
                                return Err(ReserveError::Unpublished(order_id.clone()));
                            },
                        }
                    },
                    Err(RecvError::Closed) => return Err(ReserveError::Store(StoreError::ChannelClosed)),
                }
            }
        })
        .await;

        settled.unwrap_or_else(|_| Err(ReserveError::InFlight(order_id)))
    }

    /// Current stock of an item
    pub async fn stock_of(&self, item: &str) -> u32 {
        self.store.state(|s| s.stock_of(item)).await
    }

    /// Snapshot of all stock counts
    pub async fn stock(&self) -> BTreeMap<ItemId, u32> {
        self.store.state(|s| s.stock().clone()).await
    }

    /// Registry entry of a decided order
    pub async fn outcome(&self, order_id: &OrderId) -> Option<RegistryEntry> {
        self.store.state(|s| s.registry.get(order_id).cloned()).await
    }

    /// Number of decided orders
    pub async fn processed_count(&self) -> usize {
        self.store.state(|s| s.registry.len()).await
    }

    /// Stop accepting reservations and wait for in-flight publishes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if publishes are still running.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        self.store.shutdown(timeout).await
    }
}
