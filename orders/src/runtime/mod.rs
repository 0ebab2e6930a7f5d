//! Consumers and application lifecycle.
//!
//! - **`consumer`**: queue consumer with automatic reconnection and settlement
//! - **`handlers`**: the `EventHandler` trait and one handler per workflow step
//! - **`lifecycle`**: startup, graceful shutdown and signal handling

pub mod consumer;
pub mod handlers;
pub mod lifecycle;

pub use consumer::{ConsumerError, EventConsumer};
pub use handlers::{
    EventHandler, HandlerError, InventoryHandler, NotificationHandler, StatusCallbackHandler,
};
pub use lifecycle::{Application, ApplicationError, RunningApplication, shutdown_signal};
