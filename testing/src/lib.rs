//! # Campus Orders Testing
//!
//! Testing utilities for the campus order workflow.
//!
//! This crate provides:
//! - Deterministic implementations of Environment traits
//! - Event bus doubles that record or fail publishes
//! - A Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use campus_orders_testing::{FlakyEventBus, RecordingEventBus};
//!
//! #[tokio::test]
//! async fn publish_is_retried() {
//!     let recorder = Arc::new(RecordingEventBus::new());
//!     let bus = Arc::new(FlakyEventBus::new(recorder.clone(), 2));
//!     // ... build a store whose environment publishes through `bus`
//!     assert_eq!(recorder.published().len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use campus_orders_core::environment::{Clock, IdGenerator};

pub mod reducer_test;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, Utc};
    use campus_orders_core::event::SerializedEvent;
    use campus_orders_core::event_bus::{
        BusFuture, Delivery, DeliveryStream, EventBus, EventBusError, QueueSpec,
    };
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use campus_orders_testing::mocks::FixedClock;
    /// use campus_orders_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Predictable identifiers: `{prefix}-1`, `{prefix}-2`, ...
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Start a sequence at 1 with the given prefix
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", self.prefix)
        }
    }

    /// Event bus that records publishes and has no queues
    ///
    /// Useful where only "what was published, under which key" matters.
    #[derive(Debug, Default)]
    pub struct RecordingEventBus {
        published: Mutex<Vec<(String, SerializedEvent)>>,
        publish_delay: Duration,
    }

    impl RecordingEventBus {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Hold every publish for `delay` before recording it
        #[must_use]
        pub fn with_publish_delay(mut self, delay: Duration) -> Self {
            self.publish_delay = delay;
            self
        }

        /// Everything published so far, in order
        #[must_use]
        pub fn published(&self) -> Vec<(String, SerializedEvent)> {
            self.published
                .lock()
                .map(|p| p.clone())
                .unwrap_or_default()
        }

        /// Routing keys published so far, in order
        #[must_use]
        pub fn topics(&self) -> Vec<String> {
            self.published().into_iter().map(|(topic, _)| topic).collect()
        }
    }

    impl EventBus for RecordingEventBus {
        fn declare_queue(&self, _spec: &QueueSpec) -> BusFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn bind_queue(&self, _queue: &str, _pattern: &str) -> BusFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
            let entry = (topic.to_string(), event.clone());
            Box::pin(async move {
                if !self.publish_delay.is_zero() {
                    tokio::time::sleep(self.publish_delay).await;
                }
                self.published
                    .lock()
                    .map_err(|e| EventBusError::Other(e.to_string()))?
                    .push(entry);
                Ok(())
            })
        }

        fn subscribe(&self, _queue: &str) -> BusFuture<'_, DeliveryStream> {
            Box::pin(async {
                let stream: DeliveryStream = Box::pin(futures::stream::pending());
                Ok(stream)
            })
        }

        fn get(&self, _queue: &str) -> BusFuture<'_, Option<Delivery>> {
            Box::pin(async { Ok(None) })
        }

        fn message_count(&self, _queue: &str) -> BusFuture<'_, usize> {
            Box::pin(async { Ok(0) })
        }
    }

    /// Wraps a bus and fails the first `failures` publishes
    ///
    /// Everything else is delegated to the inner bus.
    pub struct FlakyEventBus {
        inner: Arc<dyn EventBus>,
        remaining_failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl FlakyEventBus {
        /// Fail the next `failures` publishes, then delegate
        #[must_use]
        pub fn new(inner: Arc<dyn EventBus>, failures: usize) -> Self {
            Self {
                inner,
                remaining_failures: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
            }
        }

        /// Number of publish calls seen, failed or not
        #[must_use]
        pub fn publish_attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl EventBus for FlakyEventBus {
        fn declare_queue(&self, spec: &QueueSpec) -> BusFuture<'_, ()> {
            self.inner.declare_queue(spec)
        }

        fn bind_queue(&self, queue: &str, pattern: &str) -> BusFuture<'_, ()> {
            self.inner.bind_queue(queue, pattern)
        }

        fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if failed {
                let topic = topic.to_string();
                Box::pin(async move {
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: "injected failure".to_string(),
                    })
                })
            } else {
                self.inner.publish(topic, event)
            }
        }

        fn subscribe(&self, queue: &str) -> BusFuture<'_, DeliveryStream> {
            self.inner.subscribe(queue)
        }

        fn get(&self, queue: &str) -> BusFuture<'_, Option<Delivery>> {
            self.inner.get(queue)
        }

        fn message_count(&self, queue: &str) -> BusFuture<'_, usize> {
            self.inner.message_count(queue)
        }
    }
}

pub use mocks::{FixedClock, FlakyEventBus, RecordingEventBus, SequentialIdGenerator, test_clock};
pub use reducer_test::{ReducerTest, assertions};
