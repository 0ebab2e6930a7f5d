//! Queue bookkeeping: ready messages and in-flight deliveries.

use campus_orders_core::event::SerializedEvent;
use campus_orders_core::event_bus::QueueSpec;
use std::collections::{BTreeMap, VecDeque};

/// A message stored in a queue.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub routing_key: String,
    pub event: SerializedEvent,
    /// Times this message has been handed out so far
    pub delivery_count: u32,
}

/// Who holds an in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    /// A subscription stream
    Consumer(u64),
    /// A single `get`
    Pull,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    holder: Holder,
}

/// One durable queue.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub spec: QueueSpec,
    ready: VecDeque<Message>,
    in_flight: BTreeMap<u64, InFlight>,
    next_tag: u64,
}

impl QueueState {
    pub fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_tag: 1,
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        self.ready.push_back(message);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Prefetch 1: a consumer gets its next message only after settling the last.
    pub fn holds_unsettled(&self, consumer: u64) -> bool {
        self.in_flight
            .values()
            .any(|d| d.holder == Holder::Consumer(consumer))
    }

    /// Hand out the head message and track it until settled.
    pub fn take_next(&mut self, holder: Holder) -> Option<(u64, Message)> {
        let mut message = self.ready.pop_front()?;
        message.delivery_count = message.delivery_count.saturating_add(1);

        let tag = self.next_tag;
        self.next_tag += 1;
        self.in_flight.insert(
            tag,
            InFlight {
                message: message.clone(),
                holder,
            },
        );

        Some((tag, message))
    }

    /// Stop tracking a delivery, returning its message.
    pub fn settle(&mut self, tag: u64) -> Option<Message> {
        self.in_flight.remove(&tag).map(|d| d.message)
    }

    /// Put a message back at the head of the queue.
    pub fn requeue_front(&mut self, message: Message) {
        self.ready.push_front(message);
    }

    /// Return every unsettled delivery of a consumer to the head of the
    /// queue, keeping their original order.
    pub fn release_consumer(&mut self, consumer: u64) -> usize {
        let tags: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, d)| d.holder == Holder::Consumer(consumer))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some(message) = self.settle(*tag) {
                self.ready.push_front(message);
            }
        }

        tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> Message {
        Message {
            routing_key: "order.placed".to_string(),
            event: SerializedEvent::raw(body),
            delivery_count: 0,
        }
    }

    fn body(message: &Message) -> String {
        String::from_utf8_lossy(&message.event.data).into_owned()
    }

    #[test]
    fn take_next_is_fifo_and_counts_deliveries() {
        let mut queue = QueueState::new(QueueSpec::new("q"));
        queue.enqueue(message("a"));
        queue.enqueue(message("b"));

        let (tag_a, a) = queue.take_next(Holder::Consumer(1)).unwrap_or_else(|| unreachable!());
        assert_eq!(body(&a), "a");
        assert_eq!(a.delivery_count, 1);
        assert!(queue.holds_unsettled(1));
        assert!(!queue.holds_unsettled(2));

        assert!(queue.settle(tag_a).is_some());
        assert!(queue.settle(tag_a).is_none());
        assert_eq!(queue.ready_len(), 1);
    }

    #[test]
    fn released_deliveries_return_to_head_in_order() {
        let mut queue = QueueState::new(QueueSpec::new("q"));
        for body in ["a", "b", "c"] {
            queue.enqueue(message(body));
        }
        let _ = queue.take_next(Holder::Consumer(7));
        let _ = queue.take_next(Holder::Consumer(7));
        let _ = queue.take_next(Holder::Pull);

        assert_eq!(queue.release_consumer(7), 2);
        assert_eq!(queue.in_flight_len(), 1);

        let (_, first) = queue.take_next(Holder::Consumer(8)).unwrap_or_else(|| unreachable!());
        let (_, second) = queue.take_next(Holder::Consumer(8)).unwrap_or_else(|| unreachable!());
        assert_eq!((body(&first), body(&second)), ("a".to_string(), "b".to_string()));
        assert_eq!(first.delivery_count, 2);
    }
}
