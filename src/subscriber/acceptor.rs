//! Acknowledgment capability for a single delivery.

use crate::error::{BrokerError, Result};
use crate::metrics::BROKER_METRICS;
use crate::transport::Channel;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Settles one received message
///
/// Exactly one of `accept` or `reject` takes effect; a second call fails
/// with `InvalidState`.
#[async_trait]
pub trait MessageAcceptor: Send + Sync {
    /// Positive acknowledgment
    async fn accept(&self) -> Result<()>;

    /// Negative acknowledgment without requeue; the queue's dead-letter
    /// exchange receives the message if one is configured
    async fn reject(&self) -> Result<()>;
}

/// Acceptor bound to a delivery tag on the channel that received it
pub struct DeliveryAcceptor {
    channel: Arc<dyn Channel>,
    delivery_tag: u64,
    queue: String,
    settled: AtomicBool,
}

impl DeliveryAcceptor {
    pub fn new(channel: Arc<dyn Channel>, delivery_tag: u64, queue: impl Into<String>) -> Self {
        Self {
            channel,
            delivery_tag,
            queue: queue.into(),
            settled: AtomicBool::new(false),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether an acknowledgment decision has been sent
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::InvalidState(format!(
                "delivery {} was already settled",
                self.delivery_tag
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageAcceptor for DeliveryAcceptor {
    async fn accept(&self) -> Result<()> {
        self.claim()?;
        self.channel.ack(self.delivery_tag).await?;
        BROKER_METRICS
            .messages_accepted
            .with_label_values(&[&self.queue])
            .inc();
        tracing::debug!(queue = %self.queue, delivery_tag = self.delivery_tag, "Delivery accepted");
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.claim()?;
        self.channel.reject(self.delivery_tag, false).await?;
        BROKER_METRICS
            .messages_rejected
            .with_label_values(&[&self.queue])
            .inc();
        tracing::debug!(queue = %self.queue, delivery_tag = self.delivery_tag, "Delivery rejected");
        Ok(())
    }
}

impl std::fmt::Debug for DeliveryAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryAcceptor")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.is_settled())
            .finish()
    }
}
