//! Resilience layer between application code and an AMQP-style broker.
//!
//! Producers hand typed messages to a [`Publisher`], which either publishes
//! inline or buffers and drains in the background, reconnecting with
//! backoff so transient broker outages never drop a message. Consumers
//! register a handler on a [`Subscriber`]; handler failures run through an
//! [`ErrorHandlingChain`] that can retry, propagate for redelivery, or
//! reject to a dead-letter exchange.
//!
//! ```no_run
//! use rabbitmq_broker::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> rabbitmq_broker::Result<()> {
//! let broker = InMemoryBroker::new();
//! let settings = SubscriptionSettings::new("memory://localhost", "orders")
//!     .with_queue("orders.audit")
//!     .with_dead_letter_exchange("orders.dlx");
//!
//! let subscriber = Subscriber::<String>::builder(settings.clone())
//!     .transport(Arc::new(broker.clone()))
//!     .error_handling(ErrorHandlingChain::dead_lettering())
//!     .build()?;
//! subscriber.subscribe(|order: String| async move {
//!     println!("received {}", order);
//!     Ok(())
//! })?;
//! subscriber.start().await?;
//!
//! let publisher = Publisher::<String>::builder(settings)
//!     .transport(Arc::new(broker))
//!     .build()?;
//! publisher.start().await?;
//! publisher.produce(&"order-1".to_string()).await?;
//!
//! publisher.stop().await;
//! subscriber.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cancellation;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use error::{BrokerError, Result};
pub use publisher::Publisher;
pub use subscriber::{ErrorHandlingChain, Subscriber};

/// Common imports
pub mod prelude {
    pub use crate::backoff::BackoffConfig;
    pub use crate::cancellation::CancellationToken;
    pub use crate::codec::{
        DefaultStringDeserializer, JsonMessageDeserializer, JsonMessageSerializer,
        MessageDeserializer, MessageSerializer, StringSerializer,
    };
    pub use crate::config::{ExchangeKind, PublishMode, SubscriptionSettings};
    pub use crate::error::{BrokerError, Result};
    pub use crate::lifecycle::LifecycleState;
    pub use crate::publisher::{
        InMemoryBuffer, Publisher, PublisherBuffer, SledBuffer,
    };
    pub use crate::subscriber::{
        DeadLetterErrorHandlingStrategy, DefaultErrorHandlingStrategy, ErrorHandlingChain,
        MessageAcceptor, RetryErrorHandlingStrategy, Subscriber,
    };
    pub use crate::transport::memory::InMemoryBroker;
    pub use crate::transport::Transport;
}
