//! Publisher state machine with synchronous and asynchronous delivery.

use super::buffer::{InMemoryBuffer, PublisherBuffer};
use super::strategy::{strategy_for, PublishStrategy};
use crate::backoff::{sleep_or_cancel, BackoffConfig};
use crate::cancellation::CancellationToken;
use crate::codec::{JsonMessageSerializer, MessageSerializer};
use crate::config::{PublishMode, PublisherOptions, SubscriptionSettings};
use crate::error::{BrokerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::metrics::BROKER_METRICS;
use crate::transport::{ChannelSession, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the drain loop shares with the publisher handle
struct PublisherShared {
    name: String,
    settings: SubscriptionSettings,
    transport: Arc<dyn Transport>,
    strategy: Arc<dyn PublishStrategy>,
    buffer: Arc<dyn PublisherBuffer>,
    reconnect: BackoffConfig,
    cancel: CancellationToken,
    /// Single-writer lock on the channel
    session: AsyncMutex<Option<ChannelSession>>,
    sessions_opened: AtomicU64,
}

impl PublisherShared {
    async fn open_session(&self) -> Result<ChannelSession> {
        let session = ChannelSession::open(self.transport.as_ref(), &self.settings).await?;

        let prepared = async {
            if self.settings.confirm_publishing {
                session.channel().confirm_select().await?;
            }
            self.strategy
                .configure(&self.settings, session.channel().as_ref())
                .await
        }
        .await;

        if let Err(e) = prepared {
            session.close().await;
            return Err(e);
        }

        if self.sessions_opened.fetch_add(1, Ordering::Relaxed) > 0 {
            BROKER_METRICS
                .reconnects
                .with_label_values(&["publisher"])
                .inc();
            info!(publisher = %self.name, "Publisher channel re-established");
        } else {
            debug!(publisher = %self.name, "Publisher channel established");
        }

        Ok(session)
    }

    /// One publish attempt under the channel lock
    ///
    /// A failure discards the channel so the next attempt reconnects.
    async fn publish_once(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.session.lock().await;

        if guard.as_ref().map(|s| !s.is_open()).unwrap_or(false) {
            if let Some(stale) = guard.take() {
                stale.close().await;
            }
        }

        let result = match guard.as_ref() {
            Some(session) => {
                self.strategy
                    .publish(&self.settings, session.channel().as_ref(), payload)
                    .await
            }
            None => match self.open_session().await {
                Ok(session) => {
                    let result = self
                        .strategy
                        .publish(&self.settings, session.channel().as_ref(), payload)
                        .await;
                    *guard = Some(session);
                    result
                }
                Err(e) => Err(e),
            },
        };

        match &result {
            Ok(()) => {
                BROKER_METRICS
                    .messages_published
                    .with_label_values(&[&self.settings.exchange_name])
                    .inc();
            }
            Err(e) => {
                BROKER_METRICS
                    .publish_failures
                    .with_label_values(&[&self.settings.exchange_name, e.kind()])
                    .inc();
                if let Some(session) = guard.take() {
                    session.close().await;
                }
            }
        }

        result
    }

    fn record_depth(&self) {
        BROKER_METRICS
            .buffer_depth
            .with_label_values(&[&self.settings.exchange_name])
            .set(self.buffer.len() as f64);
    }
}

/// Background loop draining the buffer into the broker
///
/// Only cancellation ends it; transport failures requeue the payload and
/// back off.
async fn run_drain_loop(shared: Arc<PublisherShared>) {
    info!(publisher = %shared.name, "Publisher drain loop started");
    let mut consecutive_failures: u32 = 0;

    loop {
        let payload = match shared.buffer.dequeue(&shared.cancel).await {
            Ok(payload) => payload,
            Err(BrokerError::Cancelled) => break,
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                error!(publisher = %shared.name, error = %e, "Failed to read from publisher buffer");
                let delay = shared.reconnect.delay_for_attempt(consecutive_failures);
                if sleep_or_cancel(delay, &shared.cancel).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match shared.publish_once(&payload).await {
            Ok(()) => {
                consecutive_failures = 0;
                if let Err(e) = shared.buffer.commit() {
                    // The entry stays buffered and will be published again
                    error!(
                        publisher = %shared.name,
                        error = %e,
                        "Failed to remove published payload from buffer"
                    );
                }
                shared.record_depth();
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);

                if let Err(requeue_err) = shared.buffer.requeue_front(payload) {
                    error!(
                        publisher = %shared.name,
                        error = %requeue_err,
                        "Failed to requeue payload, entry lost"
                    );
                } else {
                    BROKER_METRICS
                        .messages_requeued
                        .with_label_values(&[&shared.settings.exchange_name])
                        .inc();
                }
                shared.record_depth();

                let delay = shared.reconnect.delay_for_attempt(consecutive_failures);
                warn!(
                    publisher = %shared.name,
                    error = %e,
                    attempt = consecutive_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Publish failed, payload requeued"
                );

                if sleep_or_cancel(delay, &shared.cancel).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        publisher = %shared.name,
        pending = shared.buffer.len(),
        "Publisher drain loop stopped"
    );
}

/// Typed message publisher
///
/// Built through [`Publisher::builder`], started once, stopped once.
pub struct Publisher<T> {
    shared: Arc<PublisherShared>,
    serializer: Arc<dyn MessageSerializer<T>>,
    mode: PublishMode,
    lifecycle: Lifecycle,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T> Publisher<T>
where
    T: Serialize + 'static,
{
    /// Start configuring a publisher for `settings`
    pub fn builder(settings: SubscriptionSettings) -> PublisherBuilder<T> {
        PublisherBuilder::new(settings)
    }
}

impl<T> Publisher<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Entries waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Connect and begin publishing
    ///
    /// Synchronous mode connects eagerly and fails if the broker is
    /// unreachable. Asynchronous mode connects from the drain loop, with
    /// backoff.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;

        match self.mode {
            PublishMode::Synchronous => {
                let mut guard = self.shared.session.lock().await;
                match self.shared.open_session().await {
                    Ok(session) => *guard = Some(session),
                    Err(e) => {
                        drop(guard);
                        self.lifecycle.abort_start();
                        error!(publisher = %self.shared.name, error = %e, "Publisher failed to connect");
                        return Err(e);
                    }
                }
            }
            PublishMode::Asynchronous => {
                let handle = tokio::spawn(run_drain_loop(Arc::clone(&self.shared)));
                *self.worker.lock() = Some(handle);
            }
        }

        info!(
            publisher = %self.shared.name,
            exchange = %self.shared.settings.exchange_name,
            mode = ?self.mode,
            "Publisher started"
        );
        Ok(())
    }

    /// Serialize and publish a message
    ///
    /// Synchronous mode returns once the broker accepted the publish and
    /// surfaces any failure. Asynchronous mode returns once the payload is
    /// buffered.
    pub async fn produce(&self, message: &T) -> Result<()> {
        self.lifecycle.ensure_started("produce")?;
        let payload = self.serializer.serialize(message).map_err(|e| {
            warn!(publisher = %self.shared.name, error = %e, "Message serialization failed");
            e
        })?;
        self.produce_payload(payload).await
    }

    /// Publish an already serialized payload
    pub async fn produce_payload(&self, payload: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_started("produce")?;

        match self.mode {
            PublishMode::Synchronous => {
                self.shared.publish_once(&payload).await.map_err(|e| {
                    warn!(publisher = %self.shared.name, error = %e, "Synchronous publish failed");
                    match e {
                        BrokerError::Transport(_) => e,
                        other => BrokerError::Transport(other.to_string()),
                    }
                })
            }
            PublishMode::Asynchronous => {
                self.shared.buffer.enqueue(payload, &self.shared.cancel).await?;
                self.shared.record_depth();
                Ok(())
            }
        }
    }

    /// Stop publishing and release the connection
    ///
    /// Waits for the drain loop to exit, so no publish is in flight when
    /// the channel closes. Entries still buffered are abandoned, or kept on
    /// disk by a durable buffer. Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.lifecycle.stop().is_none() {
            debug!(publisher = %self.shared.name, "Publisher already stopped");
            return;
        }

        self.shared.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(publisher = %self.shared.name, error = %e, "Drain loop panicked");
            }
        }

        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }

        let pending = self.shared.buffer.len();
        if pending > 0 {
            warn!(
                publisher = %self.shared.name,
                pending,
                "Publisher stopped with undelivered entries"
            );
        }
        info!(publisher = %self.shared.name, "Publisher stopped");
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.shared.name)
            .field("exchange", &self.shared.settings.exchange_name)
            .field("mode", &self.mode)
            .field("state", &self.lifecycle.state())
            .field("buffered", &self.shared.buffer.len())
            .finish()
    }
}

/// Builder for [`Publisher`]
pub struct PublisherBuilder<T> {
    settings: SubscriptionSettings,
    options: PublisherOptions,
    name: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    strategy: Option<Arc<dyn PublishStrategy>>,
    serializer: Option<Arc<dyn MessageSerializer<T>>>,
    buffer: Option<Arc<dyn PublisherBuffer>>,
}

impl<T> PublisherBuilder<T>
where
    T: Serialize + 'static,
{
    pub fn new(settings: SubscriptionSettings) -> Self {
        Self {
            settings,
            options: PublisherOptions::default(),
            name: None,
            transport: None,
            strategy: None,
            serializer: None,
            buffer: None,
        }
    }

    /// Broker transport; required
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Routing topology; defaults to the settings' exchange type
    pub fn strategy(mut self, strategy: impl PublishStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Message codec; defaults to JSON
    pub fn serializer(mut self, serializer: impl MessageSerializer<T> + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Custom buffer, e.g. a durable one
    pub fn buffer(mut self, buffer: impl PublisherBuffer + 'static) -> Self {
        self.buffer = Some(Arc::new(buffer));
        self
    }

    /// Custom buffer the caller keeps a handle to
    pub fn shared_buffer(mut self, buffer: Arc<dyn PublisherBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Use the plain in-memory buffer
    pub fn disable_in_memory_queue_persistence(mut self) -> Self {
        self.buffer = None;
        self
    }

    /// Publish inline on the caller's task
    pub fn publish_synchronously(mut self) -> Self {
        self.options.mode = PublishMode::Synchronous;
        self
    }

    pub fn options(mut self, options: PublisherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.options.reconnect = backoff;
        self
    }

    /// Name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate and assemble the publisher
    pub fn build(self) -> Result<Publisher<T>> {
        self.settings.validate_for_publisher()?;
        self.options.reconnect.validate()?;

        let transport = self.transport.ok_or_else(|| {
            BrokerError::Configuration("publisher requires a transport".to_string())
        })?;
        let strategy: Arc<dyn PublishStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => Arc::from(strategy_for(&self.settings)),
        };
        let serializer: Arc<dyn MessageSerializer<T>> = match self.serializer {
            Some(serializer) => serializer,
            None => Arc::new(JsonMessageSerializer::<T>::new()),
        };
        let buffer: Arc<dyn PublisherBuffer> = match self.buffer {
            Some(buffer) => buffer,
            None => Arc::new(InMemoryBuffer::with_capacity(self.options.buffer_capacity)?),
        };

        let name = self
            .name
            .unwrap_or_else(|| format!("publisher-{}", self.settings.exchange_name));

        debug!(
            publisher = %name,
            mode = ?self.options.mode,
            capacity = ?buffer.capacity(),
            "Publisher built"
        );

        Ok(Publisher {
            lifecycle: Lifecycle::new(name.clone()),
            shared: Arc::new(PublisherShared {
                name,
                settings: self.settings,
                transport,
                strategy,
                buffer,
                reconnect: self.options.reconnect,
                cancel: CancellationToken::new(),
                session: AsyncMutex::new(None),
                sessions_opened: AtomicU64::new(0),
            }),
            serializer,
            mode: self.options.mode,
            worker: parking_lot::Mutex::new(None),
        })
    }
}
