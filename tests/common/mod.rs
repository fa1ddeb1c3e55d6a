//! Common test utilities for the publisher and subscriber suites
//!
//! Provides a gated publisher buffer, an always-failing publish strategy,
//! polling helpers and Prometheus output parsing.

#![allow(dead_code)]

use async_trait::async_trait;
use rabbitmq_broker::cancellation::CancellationToken;
use rabbitmq_broker::config::{ExchangeKind, SubscriptionSettings};
use rabbitmq_broker::publisher::{InMemoryBuffer, PublishStrategy, PublisherBuffer};
use rabbitmq_broker::transport::Channel;
use rabbitmq_broker::{BrokerError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const EXCHANGE: &str = "TestExchange";
pub const QUEUE: &str = "TestQueue";
pub const ROUTING_KEY: &str = "RoutingKey";
pub const DEAD_LETTER_EXCHANGE: &str = "TestExchange-dlx";
pub const POISON_QUEUE: &str = "TestQueue-poison";

/// Direct exchange settings with a dead-letter exchange
pub fn settings() -> SubscriptionSettings {
    SubscriptionSettings::new("memory://localhost:5672", EXCHANGE)
        .with_exchange_type(ExchangeKind::Direct)
        .with_queue(QUEUE)
        .with_routing_key(ROUTING_KEY)
        .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE)
}

/// Poll `condition` every few milliseconds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Buffer whose consumer side is held back until the gate opens
///
/// Enqueues are accepted and counted while the gate is closed.
pub struct GatedBuffer {
    inner: InMemoryBuffer,
    gate: watch::Sender<bool>,
}

impl GatedBuffer {
    pub fn closed() -> Self {
        Self::wrapping(InMemoryBuffer::unbounded())
    }

    pub fn wrapping(inner: InMemoryBuffer) -> Self {
        let (gate, _) = watch::channel(false);
        Self { inner, gate }
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl PublisherBuffer for GatedBuffer {
    async fn enqueue(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        self.inner.enqueue(payload, cancel).await
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut gate = self.gate.subscribe();
        tokio::select! {
            opened = async { gate.wait_for(|open| *open).await.map(|_| ()) } => {
                opened.map_err(|_| BrokerError::Cancelled)?;
            }
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        }
        self.inner.dequeue(cancel).await
    }

    fn requeue_front(&self, payload: Vec<u8>) -> Result<()> {
        self.inner.requeue_front(payload)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }
}

/// Strategy whose every publish fails with a transport error
///
/// Clones share the attempt counter.
#[derive(Clone, Default)]
pub struct AlwaysFailingStrategy {
    attempts: Arc<AtomicU32>,
}

impl AlwaysFailingStrategy {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishStrategy for AlwaysFailingStrategy {
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }

    fn routing_key<'a>(&self, settings: &'a SubscriptionSettings) -> &'a str {
        &settings.routing_key
    }

    async fn publish(
        &self,
        _settings: &SubscriptionSettings,
        _channel: &dyn Channel,
        _payload: &[u8],
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Transport("connection reset by peer".to_string()))
    }
}

/// Value of the first sample of `metric` whose labels contain `label_value`
pub fn metric_value(output: &str, metric: &str, label_value: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter(|line| line.starts_with(metric) && line.contains(&format!("\"{}\"", label_value)))
        .find_map(|line| line.rsplit(' ').next()?.parse().ok())
}
