//! Broker transport capability.
//!
//! The publisher and subscriber only talk to the broker through these
//! traits. A production deployment plugs in an AMQP client; tests and the
//! demo use [`memory::InMemoryBroker`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  create_connection  ┌──────────────┐  create_channel  ┌───────────┐
//! │   Transport   │ ──────────────────▶ │  Connection  │ ───────────────▶ │  Channel  │
//! └───────────────┘                     └──────────────┘                  └───────────┘
//!                                                                            │
//!                                     declare / bind / publish / consume / ack / reject
//! ```

pub mod memory;

use crate::config::{ExchangeKind, SubscriptionSettings};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
}

/// One message handed out by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned identifier used for acknowledgment
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    /// Set when the broker delivered this message before
    pub redelivered: bool,
}

/// Opens connections to a broker
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_connection(&self, connection_string: &str) -> Result<Arc<dyn Connection>>;
}

/// A live broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A broker channel
///
/// Implementations synchronize internally, but callers must still avoid
/// concurrent publishers on one channel.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Put the channel into publisher-confirm mode
    async fn confirm_select(&self) -> Result<()>;

    async fn basic_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Wait for outstanding confirms; `false` if the broker nacked any
    async fn wait_for_confirms(&self) -> Result<bool>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str)
        -> Result<Box<dyn DeliveryStream>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Stream of deliveries for one consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the consumer is cancelled
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

/// A connection together with the single channel opened on it
///
/// Owned exclusively by one publisher or subscriber.
pub struct ChannelSession {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

impl ChannelSession {
    /// Connect and open a channel
    pub async fn open(
        transport: &dyn Transport,
        settings: &SubscriptionSettings,
    ) -> Result<Self> {
        let connection = transport.create_connection(&settings.connection_string).await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(
                        error = %close_err,
                        "Connection close failed after channel creation error"
                    );
                }
                return Err(e);
            }
        };

        Ok(Self { connection, channel })
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    /// Close the channel, then the connection; errors are logged only
    pub async fn close(self) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close().await {
            tracing::debug!(error = %e, "Connection close failed");
        }
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("open", &self.is_open())
            .finish()
    }
}
