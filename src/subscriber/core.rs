//! Subscriber state machine and consumption loop.

use super::acceptor::DeliveryAcceptor;
use super::strategy::{ErrorHandlingChain, HandlerInvocation};
use crate::backoff::{sleep_or_cancel, BackoffConfig};
use crate::cancellation::CancellationToken;
use crate::codec::{JsonMessageDeserializer, MessageDeserializer};
use crate::config::{ExchangeKind, SubscriberOptions, SubscriptionSettings};
use crate::error::{BrokerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::metrics::BROKER_METRICS;
use crate::transport::{ChannelSession, DeliveryStream, QueueOptions, Transport};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// User message handler
pub type MessageHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Why a consume session ended
enum ConsumeOutcome {
    Cancelled,
    /// The chain propagated a failure; the delivery is still unacked
    Unsettled(BrokerError),
    StreamFailed(BrokerError),
}

struct SubscriberShared<T> {
    name: String,
    consumer_tag: String,
    settings: SubscriptionSettings,
    transport: Arc<dyn Transport>,
    deserializer: Arc<dyn MessageDeserializer<T>>,
    chain: ErrorHandlingChain,
    handler: MessageHandler<T>,
    create_default_binding: bool,
    options: SubscriberOptions,
    cancel: CancellationToken,
}

impl<T: Send + 'static> SubscriberShared<T> {
    async fn connect(&self) -> Result<(ChannelSession, Box<dyn DeliveryStream>)> {
        let session = ChannelSession::open(self.transport.as_ref(), &self.settings).await?;
        match self.prepare(&session).await {
            Ok(stream) => Ok((session, stream)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, session: &ChannelSession) -> Result<Box<dyn DeliveryStream>> {
        let channel = session.channel();
        let settings = &self.settings;

        if self.create_default_binding {
            if let Some(dlx) = &settings.dead_letter_exchange_name {
                let poison = settings.poison_queue_name();
                channel
                    .declare_exchange(dlx, ExchangeKind::Fanout, settings.is_durable)
                    .await?;
                channel
                    .declare_queue(
                        &poison,
                        QueueOptions {
                            durable: settings.is_durable,
                            dead_letter_exchange: None,
                        },
                    )
                    .await?;
                channel.bind_queue(&poison, dlx, "").await?;
            }

            channel
                .declare_exchange(
                    &settings.exchange_name,
                    settings.exchange_type,
                    settings.is_durable,
                )
                .await?;
            channel
                .declare_queue(
                    &settings.queue_name,
                    QueueOptions {
                        durable: settings.is_durable,
                        dead_letter_exchange: settings.dead_letter_exchange_name.clone(),
                    },
                )
                .await?;
            channel
                .bind_queue(
                    &settings.queue_name,
                    &settings.exchange_name,
                    &settings.routing_key,
                )
                .await?;
        }

        channel.basic_qos(settings.prefetch_count).await?;
        channel
            .basic_consume(&settings.queue_name, &self.consumer_tag)
            .await
    }

    /// Re-invocable handler call; decoding happens inside so a bad payload
    /// counts as a handler failure
    fn invocation(&self, body: Vec<u8>) -> HandlerInvocation {
        let body: Arc<[u8]> = body.into();
        let deserializer = Arc::clone(&self.deserializer);
        let handler = Arc::clone(&self.handler);

        Arc::new(move || match deserializer.deserialize(&body) {
            Ok(message) => handler(message),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        })
    }

    /// Deliver messages until cancellation, an unsettled failure or a
    /// broken stream
    async fn consume(
        &self,
        session: &ChannelSession,
        stream: &mut dyn DeliveryStream,
    ) -> ConsumeOutcome {
        let queue = &self.settings.queue_name;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ConsumeOutcome::Cancelled,
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return ConsumeOutcome::StreamFailed(e),
                None => {
                    return ConsumeOutcome::StreamFailed(BrokerError::Transport(
                        "consumer stream ended".to_string(),
                    ))
                }
            };

            BROKER_METRICS.messages_consumed.with_label_values(&[queue]).inc();
            debug!(
                subscriber = %self.name,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                "Delivery received"
            );

            let acceptor = DeliveryAcceptor::new(
                Arc::clone(session.channel()),
                delivery.delivery_tag,
                queue.clone(),
            );
            let invocation = self.invocation(delivery.body);

            // Runs to completion; stop only takes effect between deliveries
            match self.chain.execute(&invocation, &acceptor, &self.cancel).await {
                Ok(()) => {}
                Err(BrokerError::Cancelled) => return ConsumeOutcome::Cancelled,
                Err(e) => return ConsumeOutcome::Unsettled(e),
            }
        }
    }
}

/// Consumption loop with reconnects
async fn run_consume_loop<T: Send + 'static>(
    shared: Arc<SubscriberShared<T>>,
    initial: (ChannelSession, Box<dyn DeliveryStream>),
) {
    info!(
        subscriber = %shared.name,
        queue = %shared.settings.queue_name,
        chain = %shared.chain.describe(),
        "Consumption loop started"
    );

    let mut current = Some(initial);
    let mut reconnect_attempt: u32 = 0;

    loop {
        let (session, mut stream) = match current.take() {
            Some(connected) => connected,
            None => {
                let delay = shared.options.reconnect.delay_for_attempt(reconnect_attempt);
                reconnect_attempt = reconnect_attempt.saturating_add(1);
                if sleep_or_cancel(delay, &shared.cancel).await.is_err() {
                    break;
                }

                match shared.connect().await {
                    Ok(connected) => {
                        reconnect_attempt = 0;
                        BROKER_METRICS
                            .reconnects
                            .with_label_values(&["subscriber"])
                            .inc();
                        info!(subscriber = %shared.name, "Subscriber channel re-established");
                        connected
                    }
                    Err(e) => {
                        warn!(
                            subscriber = %shared.name,
                            attempt = reconnect_attempt,
                            error = %e,
                            "Subscriber reconnect failed"
                        );
                        continue;
                    }
                }
            }
        };

        let outcome = shared.consume(&session, stream.as_mut()).await;
        // Closing the channel hands unacked deliveries back to the broker
        session.close().await;

        match outcome {
            ConsumeOutcome::Cancelled => break,
            ConsumeOutcome::Unsettled(e) => {
                warn!(
                    subscriber = %shared.name,
                    error = %e,
                    redelivery_in_ms = shared.options.redelivery_delay_ms,
                    "Delivery left unacknowledged, recycling channel"
                );
                if sleep_or_cancel(shared.options.redelivery_delay(), &shared.cancel)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ConsumeOutcome::StreamFailed(e) => {
                warn!(subscriber = %shared.name, error = %e, "Consumer stream failed, reconnecting");
            }
        }
    }

    info!(subscriber = %shared.name, "Consumption loop stopped");
}

/// Typed message subscriber
///
/// Exactly one handler is active. `subscribe` before `start` replaces any
/// previous handler (with a warning); after `start` it is rejected.
pub struct Subscriber<T> {
    name: String,
    settings: SubscriptionSettings,
    transport: Arc<dyn Transport>,
    deserializer: Arc<dyn MessageDeserializer<T>>,
    chain: ErrorHandlingChain,
    create_default_binding: bool,
    options: SubscriberOptions,
    handler: parking_lot::Mutex<Option<MessageHandler<T>>>,
    lifecycle: Lifecycle,
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T> Subscriber<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Start configuring a subscriber for `settings`
    pub fn builder(settings: SubscriptionSettings) -> SubscriberBuilder<T> {
        SubscriberBuilder::new(settings)
    }
}

impl<T: Send + 'static> Subscriber<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// Install the message handler
    pub fn subscribe<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut slot = self.handler.lock();
        if self.lifecycle.state() != LifecycleState::Created {
            return Err(BrokerError::InvalidState(format!(
                "{} cannot change its handler in state '{}'",
                self.name,
                self.lifecycle.state()
            )));
        }

        if slot.is_some() {
            warn!(subscriber = %self.name, "Replacing previously subscribed handler");
        }
        let wrapped: MessageHandler<T> = Arc::new(move |message: T| handler(message).boxed());
        *slot = Some(wrapped);
        Ok(())
    }

    /// Connect, declare the binding and start consuming
    pub async fn start(&self) -> Result<()> {
        let handler = {
            let slot = self.handler.lock();
            let handler = slot.clone().ok_or_else(|| {
                BrokerError::InvalidState(format!("{} has no handler subscribed", self.name))
            })?;
            self.lifecycle.begin_start()?;
            handler
        };

        let shared = Arc::new(SubscriberShared {
            name: self.name.clone(),
            consumer_tag: format!("{}-{}", self.name, uuid::Uuid::new_v4().simple()),
            settings: self.settings.clone(),
            transport: Arc::clone(&self.transport),
            deserializer: Arc::clone(&self.deserializer),
            chain: self.chain.clone(),
            handler,
            create_default_binding: self.create_default_binding,
            options: self.options.clone(),
            cancel: self.cancel.clone(),
        });

        let connected = match shared.connect().await {
            Ok(connected) => connected,
            Err(e) => {
                self.lifecycle.abort_start();
                error!(subscriber = %self.name, error = %e, "Subscriber failed to connect");
                return Err(e);
            }
        };

        let handle = tokio::spawn(run_consume_loop(shared, connected));
        *self.worker.lock() = Some(handle);

        info!(
            subscriber = %self.name,
            queue = %self.settings.queue_name,
            prefetch = self.settings.prefetch_count,
            "Subscriber started"
        );
        Ok(())
    }

    /// Stop consuming and close the channel
    ///
    /// A handler already running finishes before the channel closes.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.lifecycle.stop().is_none() {
            debug!(subscriber = %self.name, "Subscriber already stopped");
            return;
        }

        self.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(subscriber = %self.name, error = %e, "Consumption loop panicked");
            }
        }
        info!(subscriber = %self.name, "Subscriber stopped");
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> std::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.name)
            .field("queue", &self.settings.queue_name)
            .field("chain", &self.chain)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

/// Builder for [`Subscriber`]
pub struct SubscriberBuilder<T> {
    settings: SubscriptionSettings,
    options: SubscriberOptions,
    name: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    deserializer: Option<Arc<dyn MessageDeserializer<T>>>,
    chain: ErrorHandlingChain,
    create_default_binding: bool,
}

impl<T> SubscriberBuilder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(settings: SubscriptionSettings) -> Self {
        Self {
            settings,
            options: SubscriberOptions::default(),
            name: None,
            transport: None,
            deserializer: None,
            chain: ErrorHandlingChain::default(),
            create_default_binding: true,
        }
    }

    /// Broker transport; required
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Message codec; defaults to JSON
    pub fn deserializer(mut self, deserializer: impl MessageDeserializer<T> + 'static) -> Self {
        self.deserializer = Some(Arc::new(deserializer));
        self
    }

    /// Failure policy; defaults to a lone `default` link
    pub fn error_handling(mut self, chain: ErrorHandlingChain) -> Self {
        self.chain = chain;
        self
    }

    /// Declare exchange, queue, binding and dead-letter topology on connect
    pub fn create_default_binding(mut self, enabled: bool) -> Self {
        self.create_default_binding = enabled;
        self
    }

    pub fn options(mut self, options: SubscriberOptions) -> Self {
        self.options = options;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.options.reconnect = backoff;
        self
    }

    /// Pause before a propagated failure is handed back for redelivery
    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.options.redelivery_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Name used in logs and consumer tags
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate and assemble the subscriber
    pub fn build(self) -> Result<Subscriber<T>> {
        self.settings.validate_for_subscriber()?;
        self.options.reconnect.validate()?;

        let transport = self.transport.ok_or_else(|| {
            BrokerError::Configuration("subscriber requires a transport".to_string())
        })?;
        let deserializer: Arc<dyn MessageDeserializer<T>> = match self.deserializer {
            Some(deserializer) => deserializer,
            None => Arc::new(JsonMessageDeserializer::<T>::new()),
        };

        let name = self
            .name
            .unwrap_or_else(|| format!("subscriber-{}", self.settings.queue_name));

        debug!(subscriber = %name, chain = %self.chain.describe(), "Subscriber built");

        Ok(Subscriber {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            settings: self.settings,
            transport,
            deserializer,
            chain: self.chain,
            create_default_binding: self.create_default_binding,
            options: self.options,
            handler: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
            worker: parking_lot::Mutex::new(None),
        })
    }
}
