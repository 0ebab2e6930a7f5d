//! Reducers of the workflow.
//!
//! - [`order`]: the order store owned by Order Intake
//! - [`inventory`]: stock counts and the processed-order registry

pub mod inventory;
pub mod order;

pub use inventory::{
    InventoryAction, InventoryEnvironment, InventoryReducer, InventoryState, ProcessedOrderRegistry,
    Publication, RandomSource, RegistryEntry, ThreadRandom,
};
pub use order::{OrderAction, OrderEnvironment, OrderReducer, OrderState};
