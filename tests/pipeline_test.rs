// Pipeline Test Suite
// Publisher and subscriber wired together through one broker

mod common;

use common::{metric_value, settings, wait_until, POISON_QUEUE};
use rabbitmq_broker::backoff::BackoffConfig;
use rabbitmq_broker::config::{ExchangeKind, SubscriptionSettings};
use rabbitmq_broker::metrics::{gather_text, init_broker_metrics};
use rabbitmq_broker::publisher::Publisher;
use rabbitmq_broker::subscriber::{ErrorHandlingChain, Subscriber};
use rabbitmq_broker::transport::memory::InMemoryBroker;
use rabbitmq_broker::BrokerError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    customer: String,
    poison: bool,
}

fn order(order_id: u32, poison: bool) -> OrderPlaced {
    OrderPlaced {
        order_id,
        customer: format!("customer-{}", order_id % 3),
        poison,
    }
}

#[tokio::test]
async fn test_json_pipeline_with_dead_lettering() {
    init_broker_metrics();
    let broker = InMemoryBroker::new();
    let settings = settings().with_queue("PipelineQueue");

    let subscriber = Subscriber::<OrderPlaced>::builder(settings.clone())
        .transport(Arc::new(broker.clone()))
        .error_handling(ErrorHandlingChain::dead_lettering())
        .build()
        .unwrap();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    subscriber
        .subscribe(move |order: OrderPlaced| {
            let sink = Arc::clone(&sink);
            async move {
                if order.poison {
                    return Err(BrokerError::handler(format!("order {} is invalid", order.order_id)));
                }
                sink.lock().push(order.order_id);
                Ok(())
            }
        })
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = Publisher::<OrderPlaced>::builder(settings.clone())
        .transport(Arc::new(broker.clone()))
        .reconnect_backoff(BackoffConfig::constant(Duration::from_millis(5)))
        .build()
        .unwrap();
    publisher.start().await.unwrap();

    for id in 1..=12 {
        publisher.produce(&order(id, id % 4 == 0)).await.unwrap();
    }

    let poison_queue = settings.poison_queue_name();
    wait_until(Duration::from_secs(5), || {
        handled.lock().len() == 9 && broker.message_count(&poison_queue) == 3
    })
    .await;

    assert_eq!(*handled.lock(), vec![1, 2, 3, 5, 6, 7, 9, 10, 11]);

    let text = gather_text();
    assert!(metric_value(&text, "broker_messages_rejected_total", "PipelineQueue").unwrap() >= 3.0);
    assert!(metric_value(&text, "broker_messages_accepted_total", "PipelineQueue").unwrap() >= 9.0);

    publisher.stop().await;
    subscriber.stop().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_sync_pipeline_over_topic_exchange() {
    let broker = InMemoryBroker::new();
    let consumer_settings = SubscriptionSettings::new("memory://localhost", "events")
        .with_exchange_type(ExchangeKind::Topic)
        .with_queue("eu-orders")
        .with_routing_key("orders.eu.*");

    let subscriber = Subscriber::<OrderPlaced>::builder(consumer_settings)
        .transport(Arc::new(broker.clone()))
        .build()
        .unwrap();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    subscriber
        .subscribe(move |order: OrderPlaced| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(order);
                Ok(())
            }
        })
        .unwrap();
    subscriber.start().await.unwrap();

    let eu = Publisher::<OrderPlaced>::builder(
        SubscriptionSettings::new("memory://localhost", "events")
            .with_exchange_type(ExchangeKind::Topic)
            .with_routing_key("orders.eu.created"),
    )
    .transport(Arc::new(broker.clone()))
    .publish_synchronously()
    .build()
    .unwrap();
    let us = Publisher::<OrderPlaced>::builder(
        SubscriptionSettings::new("memory://localhost", "events")
            .with_exchange_type(ExchangeKind::Topic)
            .with_routing_key("orders.us.created"),
    )
    .transport(Arc::new(broker.clone()))
    .publish_synchronously()
    .build()
    .unwrap();
    eu.start().await.unwrap();
    us.start().await.unwrap();

    eu.produce(&order(1, false)).await.unwrap();
    us.produce(&order(2, false)).await.unwrap();
    eu.produce(&order(3, false)).await.unwrap();

    wait_until(Duration::from_secs(5), || handled.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let ids: Vec<u32> = handled.lock().iter().map(|o| o.order_id).collect();
    assert_eq!(ids, vec![1, 3]);

    eu.stop().await;
    us.stop().await;
    subscriber.stop().await;
}

#[tokio::test]
async fn test_pipeline_survives_broker_outage() {
    let broker = InMemoryBroker::new();
    let settings = settings().with_queue("OutageQueue");

    let subscriber = Subscriber::<OrderPlaced>::builder(settings.clone())
        .transport(Arc::new(broker.clone()))
        .reconnect_backoff(BackoffConfig::constant(Duration::from_millis(5)))
        .build()
        .unwrap();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    subscriber
        .subscribe(move |order: OrderPlaced| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(order.order_id);
                Ok(())
            }
        })
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = Publisher::<OrderPlaced>::builder(settings)
        .transport(Arc::new(broker.clone()))
        .reconnect_backoff(BackoffConfig::constant(Duration::from_millis(5)))
        .build()
        .unwrap();
    publisher.start().await.unwrap();

    for id in 1..=5 {
        publisher.produce(&order(id, false)).await.unwrap();
    }
    broker.fail_next_connections(4);
    broker.drop_connections();
    for id in 6..=10 {
        publisher.produce(&order(id, false)).await.unwrap();
    }

    wait_until(Duration::from_secs(5), || handled.lock().len() >= 10).await;

    // At-least-once: an outage may redeliver, but nothing goes missing
    let mut ids = handled.lock().clone();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids, (1..=10).collect::<Vec<u32>>());
    assert_eq!(broker.message_count(POISON_QUEUE), 0);

    publisher.stop().await;
    subscriber.stop().await;
}
