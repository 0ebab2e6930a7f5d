//! Delivery semantics of the in-memory broker: fan-out, FIFO backlog,
//! acknowledgement, requeue on consumer loss and dead-lettering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

use campus_orders_broker::{InMemoryBroker, X_DEATH_HEADER};
use campus_orders_core::event::SerializedEvent;
use campus_orders_core::event_bus::{Delivery, DeliveryStream, EventBus, EventBusError, QueueSpec};
use futures::StreamExt;
use std::time::Duration;

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within timeout")
        .expect("stream still open")
        .expect("delivery, not error")
}

async fn nothing_within(stream: &mut DeliveryStream, wait: Duration) -> bool {
    tokio::time::timeout(wait, stream.next()).await.is_err()
}

fn body(delivery: &Delivery) -> String {
    String::from_utf8_lossy(&delivery.event.data).into_owned()
}

async fn broker_with(queues: &[(&str, &str)]) -> InMemoryBroker {
    let broker = InMemoryBroker::builder().exchange("orders_exchange").build();
    for (queue, pattern) in queues {
        broker.declare_queue(&QueueSpec::new(*queue)).await.unwrap();
        broker.bind_queue(queue, pattern).await.unwrap();
    }
    broker
}

#[tokio::test]
async fn one_event_fans_out_to_every_bound_queue() {
    let broker = broker_with(&[
        ("inventory_reserved", "inventory.reserved"),
        ("order_callback_reserved", "inventory.reserved"),
        ("order_callback_failed", "inventory.failed"),
    ])
    .await;

    broker
        .publish("inventory.reserved", &SerializedEvent::raw("r1"))
        .await
        .unwrap();

    assert_eq!(broker.message_count("inventory_reserved").await, Ok(1));
    assert_eq!(broker.message_count("order_callback_reserved").await, Ok(1));
    assert_eq!(broker.message_count("order_callback_failed").await, Ok(0));
}

#[tokio::test]
async fn backlog_is_delivered_in_publish_order() {
    let broker = broker_with(&[("order_placed", "order.placed")]).await;
    for i in 0..5 {
        broker
            .publish("order.placed", &SerializedEvent::raw(format!("m{i}")))
            .await
            .unwrap();
    }

    let mut stream = broker.subscribe("order_placed").await.unwrap();
    for i in 0..5 {
        let delivery = next(&mut stream).await;
        assert_eq!(body(&delivery), format!("m{i}"));
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();
    }
    assert_eq!(broker.message_count("order_placed").await, Ok(0));
    assert_eq!(broker.in_flight_count("order_placed"), Ok(0));
}

#[tokio::test]
async fn consumer_gets_one_message_at_a_time() {
    let broker = broker_with(&[("q", "k")]).await;
    broker.publish("k", &SerializedEvent::raw("a")).await.unwrap();
    broker.publish("k", &SerializedEvent::raw("b")).await.unwrap();

    let mut stream = broker.subscribe("q").await.unwrap();
    let first = next(&mut stream).await;
    assert!(nothing_within(&mut stream, Duration::from_millis(50)).await);

    first.ack().await.unwrap();
    assert_eq!(body(&next(&mut stream).await), "b");
}

#[tokio::test]
async fn waiting_consumer_is_woken_by_publish() {
    let broker = broker_with(&[("q", "k")]).await;
    let mut stream = broker.subscribe("q").await.unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish("k", &SerializedEvent::raw("late")).await.unwrap();
    });

    assert_eq!(body(&next(&mut stream).await), "late");
}

#[tokio::test]
async fn dropped_consumer_returns_unsettled_delivery_to_head() {
    let broker = broker_with(&[("q", "k")]).await;
    for body in ["a", "b"] {
        broker.publish("k", &SerializedEvent::raw(body)).await.unwrap();
    }

    let mut stream = broker.subscribe("q").await.unwrap();
    let unsettled = next(&mut stream).await;
    drop(stream);

    assert_eq!(broker.message_count("q").await, Ok(2));
    assert!(matches!(
        unsettled.ack().await,
        Err(EventBusError::UnknownDelivery { .. })
    ));

    let mut stream = broker.subscribe("q").await.unwrap();
    let again = next(&mut stream).await;
    assert_eq!(body(&again), "a");
    assert!(again.redelivered);
    assert_eq!(again.delivery_count, 2);
}

#[tokio::test]
async fn requeue_puts_message_back_at_head() {
    let broker = broker_with(&[("q", "k")]).await;
    broker.publish("k", &SerializedEvent::raw("a")).await.unwrap();
    broker.publish("k", &SerializedEvent::raw("b")).await.unwrap();

    let mut stream = broker.subscribe("q").await.unwrap();
    next(&mut stream).await.requeue().await.unwrap();

    let again = next(&mut stream).await;
    assert_eq!(body(&again), "a");
    assert!(again.redelivered);
}

#[tokio::test]
async fn reject_routes_to_dead_letter_queue_with_x_death() {
    let broker = InMemoryBroker::new();
    broker
        .declare_queue(&QueueSpec::new("order_placed").with_dead_letter("order.placed.dlq"))
        .await
        .unwrap();
    broker.declare_queue(&QueueSpec::new("order.placed.dlq")).await.unwrap();
    broker.bind_queue("order_placed", "order.placed").await.unwrap();

    broker
        .publish("order.placed", &SerializedEvent::raw("THIS-IS-NOT-JSON!!!"))
        .await
        .unwrap();

    let poison = broker.get("order_placed").await.unwrap().unwrap();
    poison.reject("undecodable payload").await.unwrap();

    assert_eq!(broker.message_count("order_placed").await, Ok(0));
    assert_eq!(broker.message_count("order.placed.dlq").await, Ok(1));

    let dead = broker.get("order.placed.dlq").await.unwrap().unwrap();
    assert_eq!(body(&dead), "THIS-IS-NOT-JSON!!!");
    let death = dead.event.header(X_DEATH_HEADER).unwrap();
    assert_eq!(death["queue"], "order_placed");
    assert_eq!(death["routing_key"], "order.placed");
    assert_eq!(death["reason"], "undecodable payload");
    assert_eq!(death["count"], 1);
}

#[tokio::test]
async fn reject_without_dead_letter_queue_discards() {
    let broker = broker_with(&[("inventory_reserved", "inventory.reserved")]).await;
    broker
        .publish("inventory.reserved", &SerializedEvent::raw("garbage"))
        .await
        .unwrap();

    let delivery = broker.get("inventory_reserved").await.unwrap().unwrap();
    delivery.reject("undecodable").await.unwrap();

    assert_eq!(broker.message_count("inventory_reserved").await, Ok(0));
    assert_eq!(broker.in_flight_count("inventory_reserved"), Ok(0));
}

#[tokio::test]
async fn outage_fails_operations_and_ends_subscriptions() {
    let broker = broker_with(&[("q", "k")]).await;
    broker.publish("k", &SerializedEvent::raw("a")).await.unwrap();

    let mut stream = broker.subscribe("q").await.unwrap();
    let in_flight = next(&mut stream).await;

    broker.set_available(false);

    let error = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, Err(EventBusError::ConnectionFailed(_))));
    drop(stream);

    assert!(matches!(
        broker.publish("k", &SerializedEvent::raw("b")).await,
        Err(EventBusError::ConnectionFailed(_))
    ));
    assert!(broker.subscribe("q").await.is_err());
    assert!(in_flight.ack().await.is_err());

    broker.set_available(true);
    assert_eq!(broker.message_count("q").await, Ok(1));
    let mut stream = broker.subscribe("q").await.unwrap();
    assert!(next(&mut stream).await.redelivered);
}
