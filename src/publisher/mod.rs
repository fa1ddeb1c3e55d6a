//! Producer side: buffering, publish strategies and the publisher state
//! machine.
//!
//! ```text
//! produce(&T) ─▶ serializer ─┬─ synchronous ─▶ strategy.publish ─▶ broker
//!                            └─ asynchronous ─▶ buffer ─▶ drain loop ─▶ strategy.publish
//! ```

pub mod buffer;
mod core;
pub mod durable;
pub mod strategy;

pub use self::core::{Publisher, PublisherBuilder};
pub use buffer::{InMemoryBuffer, PublisherBuffer};
pub use durable::SledBuffer;
pub use strategy::{
    strategy_for, DirectPublishStrategy, FanoutPublishStrategy, PublishStrategy,
    TopicPublishStrategy,
};
