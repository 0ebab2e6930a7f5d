//! Event trait and related types for the broker wire format.
//!
//! Events represent facts about things that have happened and are immutable
//! once published.
//!
//! # Design
//!
//! Events travel through the broker as JSON documents. JSON keeps the
//! envelopes inspectable in the dead-letter queue and lets consumers accept
//! messages from producers that are not written in Rust (the test harness
//! publishes raw payloads, including deliberately malformed ones).
//!
//! # Example
//!
//! ```
//! use campus_orders_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//! }
//!
//! impl Event for OrderPlaced {
//!     fn event_type(&self) -> &'static str {
//!         "OrderPlaced.v1"
//!     }
//! }
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be published through the event bus.
///
/// # Event Naming Convention
///
/// The `event_type()` method should return a stable string identifier that includes
/// a version number, e.g. `"OrderPlaced.v1"`.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` to be safely passed between threads
/// in the async runtime.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use campus_orders_core::event::Event;
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # struct OrderPlaced { order_id: String }
    /// # impl Event for OrderPlaced {
    /// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    /// # }
    ///
    /// let event = OrderPlaced { order_id: "ORD-1".to_string() };
    /// let bytes = event.to_bytes().expect("serialization should succeed");
    /// assert_eq!(bytes, br#"{"order_id":"ORD-1"}"#);
    /// ```
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are not valid
    /// JSON or required fields are missing.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event as carried by the broker.
///
/// This struct contains the event type name and the serialized bytes,
/// along with optional header metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "OrderPlaced.v1").
    pub event_type: String,

    /// The JSON-serialized event body.
    pub data: Vec<u8>,

    /// Optional header metadata.
    ///
    /// Common metadata fields:
    /// - `content_type`: always `application/json` for typed events
    /// - `x-death`: dead-letter information added by the broker
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    ///
    /// # Examples
    ///
    /// ```
    /// use campus_orders_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new(
    ///     "OrderPlaced.v1".to_string(),
    ///     b"{}".to_vec(),
    ///     None,
    /// );
    /// assert!(event.metadata.is_none());
    /// ```
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Wrap arbitrary bytes that did not come from a typed event.
    #[must_use]
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self::new("raw".to_string(), data.into(), None)
    }

    /// Create a serialized event from an `Event` value.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }

    /// Look up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Set a header value, turning non-object metadata into an object.
    pub fn set_header(&mut self, key: &str, value: serde_json::Value) {
        match self.metadata.as_mut() {
            Some(serde_json::Value::Object(map)) => {
                map.insert(key.to_string(), value);
            },
            Some(other) => {
                let previous = other.take();
                let mut map = serde_json::Map::new();
                map.insert("original".to_string(), previous);
                map.insert(key.to_string(), value);
                *other = serde_json::Value::Object(map);
            },
            None => {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), value);
                self.metadata = Some(serde_json::Value::Object(map));
            },
        }
    }

    /// Lossy UTF-8 rendering of the body, truncated for log lines.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.data).chars().take(max_chars).collect()
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}
