//! End-to-end workflow scenarios over the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

use campus_orders::aggregates::{InventoryEnvironment, InventoryReducer, InventoryState, OrderEnvironment, OrderReducer, OrderState};
use campus_orders::app::{InventoryService, OrderIntake};
use campus_orders::events::{self, OrderPlaced};
use campus_orders::topology::{self, INVENTORY_RESERVED_QUEUE, ORDER_PLACED, ORDER_PLACED_QUEUE};
use campus_orders::{
    Application, Config, IntakeError, LineItem, Order, OrderId, OrderStatus, PlaceOrderRequest,
    RunningApplication, StudentId,
};
use campus_orders_broker::InMemoryBroker;
use campus_orders_core::event::SerializedEvent;
use campus_orders_core::event_bus::EventBus;
use campus_orders_runtime::{RetryPolicy, Store};
use campus_orders_testing::{FlakyEventBus, RecordingEventBus, SequentialIdGenerator, test_clock};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn config(stock: &[(&str, u32)]) -> Config {
    let mut config = Config::default();
    config.inventory.stock = stock.iter().map(|(item, n)| ((*item).to_string(), *n)).collect();
    config.consumer.retry_delay = Duration::from_millis(10);
    config.publish.max_attempts = 3;
    config.publish.initial_delay = Duration::from_millis(1);
    config.intake.publish_timeout = Duration::from_secs(2);
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

async fn start(bus: Arc<dyn EventBus>, config: Config) -> RunningApplication {
    Application::new(config, bus)
        .with_id_generator(Arc::new(SequentialIdGenerator::new("ORD")))
        .start()
        .await
        .unwrap()
}

async fn wait_for_outcome(app: &RunningApplication, order_id: &OrderId) -> Order {
    for _ in 0..500 {
        let order = app.intake().get_order(order_id).await.unwrap();
        if order.status != OrderStatus::Placed {
            return order;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("order {order_id} never left PLACED");
}

async fn wait_until_drained(broker: &InMemoryBroker, queue: &str) {
    for _ in 0..500 {
        if broker.message_count(queue).await.unwrap() == 0 && broker.in_flight_count(queue).unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue {queue} was not drained");
}

fn order_placed(id: &str, item: &str, qty: u32) -> OrderPlaced {
    OrderPlaced {
        order_id: OrderId::new(id),
        student_id: StudentId::new("S1"),
        items: vec![LineItem::new(item, qty)],
    }
}

#[tokio::test]
async fn happy_path_reserves_and_notifies() {
    let broker = Arc::new(InMemoryBroker::new());
    let app = start(broker.clone(), config(&[("Pizza", 10)])).await;

    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 2)]))
        .await
        .unwrap();

    let order = wait_for_outcome(&app, &order_id).await;
    assert_eq!(order.status, OrderStatus::Reserved);
    assert_eq!(order.failure_reason, None);
    assert_eq!(app.inventory().stock_of("Pizza").await, 8);

    for _ in 0..100 {
        if !app.notifications().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let notifications = app.notifications().all();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].order_id, order_id);
    assert_eq!(notifications[0].message, "Your order for 2x Pizza has been confirmed!");

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn insufficient_stock_fails_the_order_with_reason() {
    let broker = Arc::new(InMemoryBroker::new());
    let app = start(broker.clone(), config(&[("Taco", 1)])).await;

    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S3", vec![LineItem::new("Taco", 5)]))
        .await
        .unwrap();

    let order = wait_for_outcome(&app, &order_id).await;
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("insufficient stock for Taco (have 1, need 5)")
    );
    assert_eq!(app.inventory().stock_of("Taco").await, 1);
    assert!(app.notifications().is_empty());

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_reserves_and_notifies_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut config = config(&[("Pizza", 10)]);
    config.inventory.workers = 4;
    let app = start(broker.clone(), config).await;

    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 2)]))
        .await
        .unwrap();

    let order = app.intake().get_order(&order_id).await.unwrap();
    let duplicate = events::to_message(&OrderPlaced {
        order_id: order.id.clone(),
        student_id: order.student_id.clone(),
        items: order.items.clone(),
    })
    .unwrap();
    for _ in 0..3 {
        broker.publish(ORDER_PLACED, &duplicate).await.unwrap();
    }

    wait_for_outcome(&app, &order_id).await;
    wait_until_drained(&broker, ORDER_PLACED_QUEUE).await;
    wait_until_drained(&broker, INVENTORY_RESERVED_QUEUE).await;
    // Notifications are dispatched on detached tasks
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(app.inventory().stock_of("Pizza").await, 8);
    assert_eq!(app.inventory().processed_count().await, 1);
    assert_eq!(
        app.intake().get_order(&order_id).await.unwrap().status,
        OrderStatus::Reserved
    );
    assert_eq!(app.notifications().len(), 1);
    assert_eq!(app.dead_letters().count().await.unwrap(), 0);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn poison_message_is_dead_lettered_once_and_does_not_block() {
    let broker = Arc::new(InMemoryBroker::new());
    let app = start(broker.clone(), config(&[("Pizza", 10)])).await;

    broker
        .publish(
            ORDER_PLACED,
            &SerializedEvent::raw(br#"{"items":[{"item_id":"Pizza","qty":1}]}"#.to_vec()),
        )
        .await
        .unwrap();
    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 1)]))
        .await
        .unwrap();

    assert_eq!(wait_for_outcome(&app, &order_id).await.status, OrderStatus::Reserved);
    wait_until_drained(&broker, ORDER_PLACED_QUEUE).await;

    let dead_letters = app.dead_letters().take(10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert!(dead_letters[0].reason.contains("missing order_id"));
    assert_eq!(dead_letters[0].source_queue, ORDER_PLACED_QUEUE);
    assert_eq!(dead_letters[0].delivery_count, 1);
    assert_eq!(app.inventory().stock_of("Pizza").await, 9);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn backlog_is_processed_in_order_once_consumers_start() {
    let broker = Arc::new(InMemoryBroker::new());
    topology::declare(broker.as_ref(), &RetryPolicy::immediate(1))
        .await
        .unwrap();

    for id in ["A", "B", "C"] {
        let message = events::to_message(&order_placed(id, "Sushi", 1)).unwrap();
        broker.publish(ORDER_PLACED, &message).await.unwrap();
    }
    assert_eq!(broker.message_count(ORDER_PLACED_QUEUE).await.unwrap(), 3);

    let app = start(broker.clone(), config(&[("Sushi", 2)])).await;
    wait_until_drained(&broker, ORDER_PLACED_QUEUE).await;

    let status = |id: &'static str| {
        let inventory = app.inventory().clone();
        async move {
            inventory
                .outcome(&OrderId::new(id))
                .await
                .map(|entry| entry.outcome.status())
        }
    };
    assert_eq!(status("A").await, Some(OrderStatus::Reserved));
    assert_eq!(status("B").await, Some(OrderStatus::Reserved));
    assert_eq!(status("C").await, Some(OrderStatus::Failed));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn broker_outage_keeps_order_placed_and_recovers() {
    let broker = Arc::new(InMemoryBroker::new());
    let app = start(broker.clone(), config(&[("Burger", 5)])).await;

    broker.set_available(false);
    let result = app
        .intake()
        .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Burger", 1)]))
        .await;
    let Err(IntakeError::PublishFailed { order_id: stranded, .. }) = result else {
        panic!("expected PublishFailed, got {result:?}");
    };
    assert_eq!(
        app.intake().get_order(&stranded).await.unwrap().status,
        OrderStatus::Placed
    );

    broker.set_available(true);
    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S2", vec![LineItem::new("Burger", 1)]))
        .await
        .unwrap();

    assert_eq!(wait_for_outcome(&app, &order_id).await.status, OrderStatus::Reserved);
    assert_eq!(app.inventory().stock_of("Burger").await, 4);
    assert_eq!(
        app.intake().get_order(&stranded).await.unwrap().status,
        OrderStatus::Placed
    );

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_publish_failures_are_retried() {
    let broker = Arc::new(InMemoryBroker::new());
    let flaky = Arc::new(FlakyEventBus::new(broker.clone(), 2));
    let app = start(flaky.clone(), config(&[("Coffee", 3)])).await;

    let order_id = app
        .intake()
        .place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Coffee", 1)]))
        .await
        .unwrap();

    assert_eq!(wait_for_outcome(&app, &order_id).await.status, OrderStatus::Reserved);
    assert!(flaky.publish_attempts() >= 4);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn several_workers_never_oversell() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut config = config(&[("Pizza", 10)]);
    config.inventory.workers = 4;
    let app = start(broker.clone(), config).await;

    let mut placed = Vec::new();
    for n in 0..20 {
        let student = format!("S{n}");
        placed.push(
            app.intake()
                .place_order(PlaceOrderRequest::new(student, vec![LineItem::new("Pizza", 1)]))
                .await
                .unwrap(),
        );
    }

    let mut reserved = 0;
    for order_id in &placed {
        if wait_for_outcome(&app, order_id).await.status == OrderStatus::Reserved {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 10);
    assert_eq!(app.inventory().stock_of("Pizza").await, 0);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn intake_returns_without_waiting_for_consumers() {
    let broker = Arc::new(InMemoryBroker::new());
    topology::declare(broker.as_ref(), &RetryPolicy::immediate(1))
        .await
        .unwrap();

    let intake = OrderIntake::new(
        Store::with_retry_policy(
            OrderState::new(),
            OrderReducer::new(),
            OrderEnvironment::new(Arc::new(test_clock()), broker.clone()),
            RetryPolicy::immediate(1),
        ),
        Arc::new(SequentialIdGenerator::new("ORD")),
        Duration::from_secs(1),
    );

    let order_id = tokio::time::timeout(
        Duration::from_millis(500),
        intake.place_order(PlaceOrderRequest::new("S1", vec![LineItem::new("Salad", 1)])),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(intake.get_order(&order_id).await.unwrap().status, OrderStatus::Placed);
    assert_eq!(broker.message_count(ORDER_PLACED_QUEUE).await.unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reservation_happens_at_most_once(deliveries in 1usize..8, qty in 1u32..5, publish_ms in 0u64..20) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let recorder = Arc::new(RecordingEventBus::new().with_publish_delay(Duration::from_millis(publish_ms)));
            let service = InventoryService::new(Store::with_retry_policy(
                InventoryState::with_stock([("Pizza", 20)]),
                InventoryReducer::new(),
                InventoryEnvironment::new(recorder.clone()),
                RetryPolicy::immediate(1),
            ));

            let attempts: Vec<_> = (0..deliveries)
                .map(|_| {
                    let service = service.clone();
                    tokio::spawn(async move { service.reserve(order_placed("ORD-1", "Pizza", qty)).await })
                })
                .collect();
            for attempt in attempts {
                attempt.await.unwrap().unwrap();
            }

            prop_assert_eq!(service.stock_of("Pizza").await, 20 - qty);
            prop_assert_eq!(service.processed_count().await, 1);
            prop_assert_eq!(recorder.topics(), vec!["inventory.reserved".to_string()]);
            Ok(())
        })?;
    }
}
