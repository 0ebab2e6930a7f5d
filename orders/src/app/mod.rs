//! Application services over the stores.

mod intake;
mod inventory;

pub use intake::{IntakeError, OrderIntake, OrderStore, PlaceOrderRequest, RequestItem};
pub use inventory::{DEFAULT_IN_FLIGHT_WAIT, InventoryService, InventoryStore, ReserveError};
