//! Consumer side: acknowledgment, failure policy and the subscriber state
//! machine.

pub mod acceptor;
mod core;
pub mod strategy;

pub use self::core::{MessageHandler, Subscriber, SubscriberBuilder};
pub use acceptor::{DeliveryAcceptor, MessageAcceptor};
pub use strategy::{
    execute_single, DeadLetterErrorHandlingStrategy, DefaultErrorHandlingStrategy,
    ErrorHandlingChain, ErrorHandlingStrategy, HandlerInvocation, RetryErrorHandlingStrategy,
};
