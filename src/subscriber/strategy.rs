//! Consumer-side failure policy.
//!
//! An [`ErrorHandlingChain`] is an ordered list of links. The handler runs
//! under the first link; when that link gives up, the next link takes over
//! and invokes the handler again. The last link's terminal behaviour
//! settles the delivery:
//!
//! | Link          | Attempts | When exhausted                          |
//! |---------------|----------|-----------------------------------------|
//! | `default`     | 1        | propagate the error, delivery unacked   |
//! | `dead-letter` | 1        | reject without requeue                  |
//! | `retry`       | N        | propagate the error, delivery unacked   |
//!
//! A chain `default → dead-letter` therefore invokes the handler twice and
//! then rejects the delivery, which the broker routes to the queue's
//! dead-letter exchange.

use super::acceptor::MessageAcceptor;
use crate::backoff::{sleep_or_cancel, BackoffConfig};
use crate::cancellation::CancellationToken;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Re-invocable handler call for one delivery
pub type HandlerInvocation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One link of the chain
#[async_trait]
pub trait ErrorHandlingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Handler invocations this link performs before giving up
    fn attempts(&self) -> u32 {
        1
    }

    /// Pause before retry number `retry` (1-based) within this link
    fn retry_delay(&self, _retry: u32) -> Duration {
        Duration::ZERO
    }

    /// Terminal behaviour when this is the last link and every attempt
    /// failed
    async fn on_exhausted(&self, error: BrokerError, acceptor: &dyn MessageAcceptor) -> Result<()>;
}

/// Propagates the failure and leaves the delivery unacknowledged
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandlingStrategy;

#[async_trait]
impl ErrorHandlingStrategy for DefaultErrorHandlingStrategy {
    fn name(&self) -> &str {
        "default"
    }

    async fn on_exhausted(&self, error: BrokerError, _acceptor: &dyn MessageAcceptor) -> Result<()> {
        warn!(error = %error, "Message handling failed, delivery left unacknowledged");
        Err(error)
    }
}

/// Rejects the delivery without requeue
///
/// Relies on the queue's `x-dead-letter-exchange`; nothing is published
/// from here.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadLetterErrorHandlingStrategy;

#[async_trait]
impl ErrorHandlingStrategy for DeadLetterErrorHandlingStrategy {
    fn name(&self) -> &str {
        "dead-letter"
    }

    async fn on_exhausted(&self, error: BrokerError, acceptor: &dyn MessageAcceptor) -> Result<()> {
        warn!(error = %error, "Message handling failed, rejecting to dead-letter exchange");
        acceptor.reject().await
    }
}

/// Retries the handler with backoff before giving up
#[derive(Debug, Clone)]
pub struct RetryErrorHandlingStrategy {
    attempts: u32,
    backoff: BackoffConfig,
}

impl RetryErrorHandlingStrategy {
    /// `attempts` handler invocations in total, at least one
    pub fn new(attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl ErrorHandlingStrategy for RetryErrorHandlingStrategy {
    fn name(&self) -> &str {
        "retry"
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        self.backoff.delay_for_attempt(retry)
    }

    async fn on_exhausted(&self, error: BrokerError, _acceptor: &dyn MessageAcceptor) -> Result<()> {
        warn!(
            attempts = self.attempts,
            error = %error,
            "Retries exhausted, delivery left unacknowledged"
        );
        Err(error)
    }
}

/// Ordered list of error handling links
#[derive(Clone)]
pub struct ErrorHandlingChain {
    links: Vec<Arc<dyn ErrorHandlingStrategy>>,
}

impl ErrorHandlingChain {
    /// Chain with a single link
    pub fn new(first: impl ErrorHandlingStrategy + 'static) -> Self {
        Self {
            links: vec![Arc::new(first)],
        }
    }

    /// Append a link that takes over when the current last one gives up
    pub fn then(mut self, next: impl ErrorHandlingStrategy + 'static) -> Self {
        self.links.push(Arc::new(next));
        self
    }

    /// `default → dead-letter`
    pub fn dead_lettering() -> Self {
        Self::new(DefaultErrorHandlingStrategy).then(DeadLetterErrorHandlingStrategy)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Link names joined with arrows, for logs
    pub fn describe(&self) -> String {
        self.links
            .iter()
            .map(|link| link.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Run the handler under the chain and settle the delivery
    ///
    /// `Ok` means the delivery was accepted or rejected. `Err` means it
    /// is still unacknowledged: the last link propagated the failure, or
    /// cancellation interrupted a retry pause.
    pub async fn execute(
        &self,
        handler: &HandlerInvocation,
        acceptor: &dyn MessageAcceptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let links: Vec<&dyn ErrorHandlingStrategy> =
            self.links.iter().map(|link| link.as_ref()).collect();
        execute_links(&links, handler, acceptor, cancel).await
    }
}

impl Default for ErrorHandlingChain {
    fn default() -> Self {
        Self::new(DefaultErrorHandlingStrategy)
    }
}

impl std::fmt::Debug for ErrorHandlingChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ErrorHandlingChain")
            .field(&self.describe())
            .finish()
    }
}

/// Run a lone link as a chain of one
pub async fn execute_single(
    strategy: &dyn ErrorHandlingStrategy,
    handler: &HandlerInvocation,
    acceptor: &dyn MessageAcceptor,
    cancel: &CancellationToken,
) -> Result<()> {
    execute_links(&[strategy], handler, acceptor, cancel).await
}

enum LinkOutcome {
    Succeeded,
    Failed(BrokerError),
    Cancelled,
}

async fn run_link(
    link: &dyn ErrorHandlingStrategy,
    handler: &HandlerInvocation,
    cancel: &CancellationToken,
) -> LinkOutcome {
    let attempts = link.attempts().max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = link.retry_delay(attempt - 1);
            if sleep_or_cancel(delay, cancel).await.is_err() {
                return LinkOutcome::Cancelled;
            }
        }

        match invoke_guarded(handler).await {
            Ok(()) => return LinkOutcome::Succeeded,
            Err(e) => {
                debug!(strategy = link.name(), attempt, attempts, error = %e, "Handler attempt failed");
                last_error = Some(e);
            }
        }
    }

    LinkOutcome::Failed(
        last_error.unwrap_or_else(|| BrokerError::Handler("handler was not invoked".to_string())),
    )
}

/// Invoke the handler, turning a panic into a `Handler` error
async fn invoke_guarded(handler: &HandlerInvocation) -> Result<()> {
    match AssertUnwindSafe(async { handler().await }).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "Handler panicked");
            Err(BrokerError::Handler(format!("handler panicked: {}", message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn execute_links(
    links: &[&dyn ErrorHandlingStrategy],
    handler: &HandlerInvocation,
    acceptor: &dyn MessageAcceptor,
    cancel: &CancellationToken,
) -> Result<()> {
    let default_link = DefaultErrorHandlingStrategy;
    let (last, forwarding) = match links.split_last() {
        Some((last, forwarding)) => (*last, forwarding),
        None => (&default_link as &dyn ErrorHandlingStrategy, &[][..]),
    };

    for link in forwarding {
        match run_link(*link, handler, cancel).await {
            LinkOutcome::Succeeded => return acceptor.accept().await,
            LinkOutcome::Cancelled => return Err(BrokerError::Cancelled),
            LinkOutcome::Failed(e) => {
                debug!(strategy = link.name(), error = %e, "Forwarding failure to next strategy");
            }
        }
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
    }

    match run_link(last, handler, cancel).await {
        LinkOutcome::Succeeded => acceptor.accept().await,
        LinkOutcome::Cancelled => Err(BrokerError::Cancelled),
        LinkOutcome::Failed(e) => last.on_exhausted(e, acceptor).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingAcceptor {
        accepted: AtomicU32,
        rejected: AtomicU32,
    }

    #[async_trait]
    impl MessageAcceptor for RecordingAcceptor {
        async fn accept(&self) -> Result<()> {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self) -> Result<()> {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Handler failing its first `failures` invocations
    fn flaky_handler(failures: u32) -> (HandlerInvocation, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler: HandlerInvocation = Arc::new(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call <= failures {
                    Err(BrokerError::handler(format!("failure #{}", call)))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        (handler, calls)
    }

    fn fast_retry(attempts: u32) -> RetryErrorHandlingStrategy {
        RetryErrorHandlingStrategy::new(attempts, BackoffConfig::constant(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_success_accepts_once() {
        let (handler, calls) = flaky_handler(0);
        let acceptor = RecordingAcceptor::default();

        ErrorHandlingChain::dead_lettering()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_alone_propagates_without_ack() {
        let (handler, calls) = flaky_handler(u32::MAX);
        let acceptor = RecordingAcceptor::default();

        let result = ErrorHandlingChain::default()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(BrokerError::Handler(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_forwards_to_dead_letter() {
        let (handler, calls) = flaky_handler(u32::MAX);
        let acceptor = RecordingAcceptor::default();

        ErrorHandlingChain::dead_lettering()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        // Next link re-invokes the handler before giving up
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_link_success_accepts() {
        let (handler, calls) = flaky_handler(1);
        let acceptor = RecordingAcceptor::default();

        ErrorHandlingChain::dead_lettering()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let (handler, calls) = flaky_handler(u32::MAX);
        let acceptor = RecordingAcceptor::default();
        let chain = ErrorHandlingChain::new(fast_retry(3)).then(DeadLetterErrorHandlingStrategy);
        assert_eq!(chain.describe(), "retry -> dead-letter");

        chain
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let (handler, calls) = flaky_handler(2);
        let acceptor = RecordingAcceptor::default();

        execute_single(&fast_retry(5), &handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_dead_letter_rejects_after_one_attempt() {
        let (handler, calls) = flaky_handler(u32::MAX);
        let acceptor = RecordingAcceptor::default();

        execute_single(
            &DeadLetterErrorHandlingStrategy,
            &handler,
            &acceptor,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_pause_leaves_unacked() {
        let (handler, calls) = flaky_handler(u32::MAX);
        let acceptor = RecordingAcceptor::default();
        let cancel = CancellationToken::new();
        let chain = ErrorHandlingChain::new(RetryErrorHandlingStrategy::new(
            10,
            BackoffConfig::constant(Duration::from_secs(30)),
        ))
        .then(DeadLetterErrorHandlingStrategy);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            chain.execute(&handler, &acceptor, &cancel),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_handler_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler: HandlerInvocation = Arc::new(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call > 0 {
                    panic!("handler blew up");
                }
                Ok(())
            }
            .boxed()
        });
        let acceptor = RecordingAcceptor::default();

        ErrorHandlingChain::dead_lettering()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(acceptor.rejected.load(Ordering::SeqCst), 1);

        let result = ErrorHandlingChain::default()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await;
        match result {
            Err(BrokerError::Handler(message)) => assert!(message.contains("handler blew up")),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_before_first_poll_is_caught() {
        let handler: HandlerInvocation =
            Arc::new(|| -> BoxFuture<'static, Result<()>> { panic!("{} failed to build", "future") });
        let acceptor = RecordingAcceptor::default();

        let result = ErrorHandlingChain::default()
            .execute(&handler, &acceptor, &CancellationToken::new())
            .await;

        match result {
            Err(BrokerError::Handler(message)) => assert!(message.contains("future failed to build")),
            other => panic!("expected handler error, got {:?}", other),
        }
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 0);
    }
}
