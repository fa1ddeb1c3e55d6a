//! In-process broker implementing the transport capability.
//!
//! Models the parts of AMQP the resilience layer depends on:
//! - fanout, direct and topic exchanges plus the default exchange
//! - per-consumer prefetch with ack / reject
//! - requeue of unacknowledged deliveries when a channel or connection
//!   closes, flagged as `redelivered`
//! - broker-side dead-lettering on `reject(requeue = false)`
//! - publisher confirms
//!
//! Faults can be injected to exercise the reconnect paths.
//!
//! ## Example
//!
//! ```
//! use rabbitmq_broker::config::ExchangeKind;
//! use rabbitmq_broker::transport::memory::InMemoryBroker;
//! use rabbitmq_broker::transport::QueueOptions;
//!
//! let broker = InMemoryBroker::new();
//! broker.declare_exchange("events", ExchangeKind::Fanout).unwrap();
//! broker.declare_queue("audit", QueueOptions::default()).unwrap();
//! broker.bind_queue("audit", "events", "").unwrap();
//!
//! broker.publish_to_exchange("events", "", b"hello").unwrap();
//! assert_eq!(broker.get("audit"), Some(b"hello".to_vec()));
//! ```

use super::{Channel, Connection, Delivery, DeliveryStream, QueueOptions, Transport};
use crate::config::ExchangeKind;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dead_letter_exchange: Option<String>,
}

#[derive(Debug)]
struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    confirm_mode: bool,
    nacked: bool,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    /// Open connections; closed ones are forgotten
    connections: HashSet<u64>,
    /// Open channels; closed ones are forgotten
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
}

impl BrokerState {
    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels
            .get(&channel_id)
            .map(|c| self.connections.contains(&c.connection_id))
            .unwrap_or(false)
    }

    fn ensure_channel(&self, channel_id: u64) -> Result<()> {
        if self.channel_open(channel_id) {
            Ok(())
        } else {
            Err(BrokerError::Transport("channel is closed".to_string()))
        }
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name.is_empty() {
            return Err(BrokerError::Transport(
                "ACCESS_REFUSED - the default exchange cannot be declared".to_string(),
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Transport(format!(
                "PRECONDITION_FAILED - exchange '{}' exists with type '{}'",
                name,
                existing.kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, name: &str, options: QueueOptions) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange != options.dead_letter_exchange => {
                Err(BrokerError::Transport(format!(
                    "PRECONDITION_FAILED - queue '{}' exists with different arguments",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        messages: VecDeque::new(),
                        dead_letter_exchange: options.dead_letter_exchange,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Transport(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    /// Route a message; returns the number of queues it landed in
    fn route(&mut self, exchange: &str, message: StoredMessage) -> Result<usize> {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key names the queue
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let state = self.exchanges.get(exchange).ok_or_else(|| {
                BrokerError::Transport(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;

            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &state.bindings {
                let matched = match state.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => key == &message.routing_key,
                    ExchangeKind::Topic => topic_matches(key, &message.routing_key),
                };
                if matched && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.messages.push_back(message.clone());
            }
        }

        Ok(targets.len())
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone());

        match dlx {
            Some(dlx) => {
                message.redelivered = false;
                message.exchange = dlx.clone();
                match self.route(&dlx, message) {
                    Ok(0) => tracing::debug!(queue, dlx = %dlx, "Dead-lettered message was unroutable"),
                    Ok(_) => {}
                    Err(e) => tracing::debug!(queue, error = %e, "Dead-letter exchange missing, message dropped"),
                }
            }
            None => tracing::debug!(queue, "Rejected message dropped, no dead-letter exchange"),
        }
    }

    /// Put every unacknowledged delivery of the channel back at the head
    /// of its queue, preserving delivery order
    fn requeue_channel(&mut self, channel_id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.requeue_channel(channel_id);
        self.channels.remove(&channel_id);
    }

    fn close_connection(&mut self, connection_id: u64) {
        self.connections.remove(&connection_id);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
    }

    fn in_flight(&self, channel_id: u64) -> usize {
        self.unacked.values().filter(|u| u.channel_id == channel_id).count()
    }
}

/// AMQP topic pattern match: `*` is one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
    next_id: AtomicU64,
    connections_created: AtomicU64,
    published: AtomicU64,
    fail_connections: AtomicUsize,
    fail_publishes: AtomicUsize,
    nack_confirms: AtomicUsize,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Thread-safe in-memory broker; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a new, empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange without a connection
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.inner.state.lock().declare_exchange(name, kind)
    }

    /// Declare a queue without a connection
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.inner.state.lock().declare_queue(name, options)
    }

    /// Bind a queue without a connection
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.state.lock().bind_queue(queue, exchange, routing_key)
    }

    /// Publish from outside any publisher
    pub fn publish_to_exchange(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let message = StoredMessage {
            body: body.to_vec(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        self.inner.state.lock().route(exchange, message)?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Take the head of a queue with auto-ack
    pub fn get(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.inner.state.lock();
        state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
            .map(|m| m.body)
    }

    /// Take the head of a queue as a delivery, with auto-ack
    pub fn get_delivery(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.inner.state.lock();
        let message = state.queues.get_mut(queue)?.messages.pop_front()?;
        Some(Delivery {
            delivery_tag: self.inner.next_id(),
            body: message.body,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
        })
    }

    /// Messages ready for delivery in a queue
    pub fn message_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out and not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    /// Messages accepted by exchanges so far
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Connections ever opened successfully
    pub fn connections_created(&self) -> u64 {
        self.inner.connections_created.load(Ordering::Relaxed)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .len()
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connections(&self, n: usize) {
        self.inner.fail_connections.store(n, Ordering::Release);
    }

    /// Make the next `n` publishes fail with a transport error
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.fail_publishes.store(n, Ordering::Release);
    }

    /// Make the next `n` confirmed publishes come back nacked
    pub fn nack_next_confirms(&self, n: usize) {
        self.inner.nack_confirms.store(n, Ordering::Release);
    }

    /// Simulate a network partition: every open connection dies
    pub fn drop_connections(&self) {
        {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state.connections.iter().copied().collect();
            for id in ids {
                state.close_connection(id);
            }
        }
        tracing::debug!("In-memory broker dropped all connections");
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn create_connection(&self, connection_string: &str) -> Result<Arc<dyn Connection>> {
        if connection_string.is_empty() {
            return Err(BrokerError::Configuration(
                "connection string must not be empty".to_string(),
            ));
        }
        if BrokerInner::take_fault(&self.inner.fail_connections) {
            return Err(BrokerError::Transport(format!(
                "connection refused: {}",
                connection_string
            )));
        }

        let id = self.inner.next_id();
        self.inner.state.lock().connections.insert(id);
        self.inner.connections_created.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(InMemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Connection to an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.inner.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::Transport("connection is closed".to_string()));
        }

        let id = self.inner.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                confirm_mode: false,
                nacked: false,
            },
        );

        Ok(Arc::new(InMemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.state.lock().close_connection(self.id);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner
            .state
            .lock()
            .connections
            .contains(&self.id)
    }
}

/// Channel on an [`InMemoryConnection`]
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        state.declare_exchange(name, kind)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        state.declare_queue(name, options)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        state.bind_queue(queue, exchange, routing_key)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirm_mode = true;
        }
        Ok(())
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.ensure_channel(self.id)?;

            if BrokerInner::take_fault(&self.inner.fail_publishes) {
                return Err(BrokerError::Transport("publish failed: connection reset".to_string()));
            }

            let confirm_mode = state
                .channels
                .get(&self.id)
                .map(|c| c.confirm_mode)
                .unwrap_or(false);
            if confirm_mode && BrokerInner::take_fault(&self.inner.nack_confirms) {
                if let Some(channel) = state.channels.get_mut(&self.id) {
                    channel.nacked = true;
                }
                return Ok(());
            }

            let message = StoredMessage {
                body: body.to_vec(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            };
            state.route(exchange, message)?;
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| BrokerError::Transport("channel is closed".to_string()))?;
        if !channel.confirm_mode {
            return Err(BrokerError::Transport(
                "channel is not in confirm mode".to_string(),
            ));
        }
        let nacked = std::mem::take(&mut channel.nacked);
        Ok(!nacked)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>> {
        let state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        Ok(Box::new(InMemoryDeliveryStream {
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            inner: Arc::clone(&self.inner),
            finished: false,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel_id == self.id => {
                state.unacked.remove(&delivery_tag);
            }
            _ => {
                return Err(BrokerError::Transport(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let unacked = match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel_id == self.id => state.unacked.remove(&delivery_tag),
            _ => None,
        }
        .ok_or_else(|| {
            BrokerError::Transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(message);
            }
        } else {
            state.dead_letter(&unacked.queue, unacked.message);
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.state.lock().close_channel(self.id);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().channel_open(self.id)
    }
}

struct InMemoryDeliveryStream {
    channel_id: u64,
    queue: String,
    consumer_tag: String,
    inner: Arc<BrokerInner>,
    finished: bool,
}

impl InMemoryDeliveryStream {
    fn try_take(&self) -> Option<Result<Delivery>> {
        let mut state = self.inner.state.lock();
        if !state.channel_open(self.channel_id) {
            return Some(Err(BrokerError::Transport(format!(
                "consumer '{}' lost its channel",
                self.consumer_tag
            ))));
        }

        let prefetch = state
            .channels
            .get(&self.channel_id)
            .map(|c| c.prefetch)
            .unwrap_or(0);
        if prefetch > 0 && state.in_flight(self.channel_id) >= prefetch as usize {
            return None;
        }

        let queue = match state.queues.get_mut(&self.queue) {
            Some(queue) => queue,
            None => {
                return Some(Err(BrokerError::Transport(format!(
                    "queue '{}' was deleted",
                    self.queue
                ))))
            }
        };
        let message = queue.messages.pop_front()?;

        let tag = self.inner.next_id();
        let delivery = Delivery {
            delivery_tag: tag,
            body: message.body.clone(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel_id: self.channel_id,
                queue: self.queue.clone(),
                message,
            },
        );
        Some(Ok(delivery))
    }
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        if self.finished {
            return None;
        }
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                if result.is_err() {
                    self.finished = true;
                }
                return Some(result);
            }

            notified.await;
        }
    }
}
