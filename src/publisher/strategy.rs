//! Publish strategies: one network publish with a given routing topology.

use crate::config::{ExchangeKind, SubscriptionSettings};
use crate::error::{BrokerError, Result};
use crate::transport::Channel;
use async_trait::async_trait;

/// Publishes one payload on a live channel
///
/// The publisher is agnostic to which variant is installed.
#[async_trait]
pub trait PublishStrategy: Send + Sync {
    /// Exchange type this strategy publishes to
    fn exchange_kind(&self) -> ExchangeKind;

    /// Routing key for a publish under `settings`
    fn routing_key<'a>(&self, settings: &'a SubscriptionSettings) -> &'a str;

    /// Prepare a freshly opened channel; declares the target exchange
    async fn configure(&self, settings: &SubscriptionSettings, channel: &dyn Channel) -> Result<()> {
        channel
            .declare_exchange(&settings.exchange_name, self.exchange_kind(), settings.is_durable)
            .await
    }

    /// Publish one payload; any network or protocol failure is a
    /// `Transport` error
    async fn publish(
        &self,
        settings: &SubscriptionSettings,
        channel: &dyn Channel,
        payload: &[u8],
    ) -> Result<()> {
        channel
            .basic_publish(&settings.exchange_name, self.routing_key(settings), payload)
            .await?;

        if settings.confirm_publishing && !channel.wait_for_confirms().await? {
            return Err(BrokerError::Transport(format!(
                "broker nacked publish to exchange '{}'",
                settings.exchange_name
            )));
        }
        Ok(())
    }
}

/// Broadcast to every queue bound to the exchange
#[derive(Debug, Default, Clone, Copy)]
pub struct FanoutPublishStrategy;

impl PublishStrategy for FanoutPublishStrategy {
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Fanout
    }

    fn routing_key<'a>(&self, _settings: &'a SubscriptionSettings) -> &'a str {
        ""
    }
}

/// Point-route by exact routing key
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectPublishStrategy;

impl PublishStrategy for DirectPublishStrategy {
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }

    fn routing_key<'a>(&self, settings: &'a SubscriptionSettings) -> &'a str {
        &settings.routing_key
    }
}

/// Route by routing-key pattern
#[derive(Debug, Default, Clone, Copy)]
pub struct TopicPublishStrategy;

impl PublishStrategy for TopicPublishStrategy {
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    fn routing_key<'a>(&self, settings: &'a SubscriptionSettings) -> &'a str {
        &settings.routing_key
    }
}

/// Strategy matching the exchange type in `settings`
pub fn strategy_for(settings: &SubscriptionSettings) -> Box<dyn PublishStrategy> {
    match settings.exchange_type {
        ExchangeKind::Fanout => Box::new(FanoutPublishStrategy),
        ExchangeKind::Direct => Box::new(DirectPublishStrategy),
        ExchangeKind::Topic => Box::new(TopicPublishStrategy),
    }
}
