//! Campus orders demo.
//!
//! Runs the whole workflow on the in-memory broker: places a few orders,
//! redelivers one of them, publishes a poison message, then reports order
//! statuses, notifications and dead letters.
//!
//! `--serve` keeps the consumers running until Ctrl+C instead of shutting
//! down after the demo.

use anyhow::Context;
use campus_orders::config::DEFAULT_LOG_FILTER;
use campus_orders::events::{self, OrderPlaced};
use campus_orders::topology::ORDER_PLACED;
use campus_orders::{Application, Config, LineItem, OrderStatus, PlaceOrderRequest};
use campus_orders_broker::InMemoryBroker;
use campus_orders_core::event::SerializedEvent;
use campus_orders_core::event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let serve = std::env::args().any(|arg| arg == "--serve");
    info!(
        exchange = %config.exchange,
        availability = %config.inventory.availability,
        inventory_workers = config.inventory.workers,
        serve,
        "Starting campus orders"
    );

    let broker = Arc::new(InMemoryBroker::builder().exchange(config.exchange.clone()).build());
    let app = Application::new(config, broker.clone())
        .start()
        .await
        .context("failed to start the application")?;

    let requests = [
        PlaceOrderRequest::new("S1", vec![LineItem::new("Pizza", 2)]),
        PlaceOrderRequest::new("S2", vec![LineItem::new("Sushi", 1), LineItem::new("Coffee", 2)]),
        PlaceOrderRequest::new("S3", vec![LineItem::new("Taco", 500)]),
        PlaceOrderRequest::anonymous(vec![LineItem::new("Burger", 1)]),
    ];

    let mut placed = Vec::new();
    for request in requests {
        match app.intake().place_order(request).await {
            Ok(order_id) => {
                info!(order_id = %order_id, "Order placed");
                placed.push(order_id);
            },
            Err(e) => warn!(error = %e, "Order not placed"),
        }
    }

    if let Some(first) = placed.first() {
        let order = app.intake().get_order(first).await?;
        let redelivery = events::to_message(&OrderPlaced {
            order_id: order.id.clone(),
            student_id: order.student_id.clone(),
            items: order.items.clone(),
        })?;
        info!(order_id = %order.id, "Publishing OrderPlaced again to show deduplication");
        broker.publish(ORDER_PLACED, &redelivery).await?;
    }

    info!("Publishing a poison message");
    broker
        .publish(ORDER_PLACED, &SerializedEvent::raw(br#"{"student_id":"S9","items":[]}"#.to_vec()))
        .await?;

    wait_for_settlement(&app).await;

    for order in app.intake().list_orders().await {
        info!(
            order_id = %order.id,
            student_id = %order.student_id,
            status = %order.status,
            reason = order.failure_reason.as_deref().unwrap_or("-"),
            "Order"
        );
    }
    for notification in app.notifications().all() {
        info!(order_id = %notification.order_id, message = %notification.message, "Notification");
    }
    info!(stock = ?app.inventory().stock().await, "Remaining stock");
    for record in app.dead_letters().take(usize::MAX).await? {
        warn!(
            source_queue = %record.source_queue,
            reason = %record.reason,
            payload = %record.payload_text(),
            "Dead letter"
        );
    }

    if serve {
        info!("Running until Ctrl+C");
        app.run_until_signal().await?;
    } else {
        app.shutdown().await?;
    }

    Ok(())
}

/// Wait until every order has left `PLACED` and the poison message was dead-lettered.
async fn wait_for_settlement(app: &campus_orders::RunningApplication) {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let pending = app
            .intake()
            .list_orders()
            .await
            .iter()
            .filter(|order| order.status == OrderStatus::Placed)
            .count();
        let dead_letters = app.dead_letters().count().await.unwrap_or_default();

        if pending == 0 && dead_letters > 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pending, "Workflow did not settle in time");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
