//! FIFO of serialized payloads sitting between `produce` and the drain loop.

use crate::cancellation::CancellationToken;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Pluggable publisher buffer
///
/// Many callers enqueue, a single drain loop dequeues. Implementations
/// synchronize internally.
#[async_trait]
pub trait PublisherBuffer: Send + Sync {
    /// Append a payload. A bounded buffer waits for space; cancellation
    /// while waiting yields `BrokerError::Cancelled`.
    async fn enqueue(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<()>;

    /// Take the oldest payload, waiting until one is available or the
    /// token fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Vec<u8>>;

    /// Put a payload whose publish failed back at the head.
    ///
    /// Never waits: the entry was already counted against the capacity.
    fn requeue_front(&self, payload: Vec<u8>) -> Result<()>;

    /// Confirm that the payload last handed out by `dequeue` was published.
    ///
    /// Buffers that keep the in-flight entry until it is confirmed drop it
    /// here. The in-memory buffer already removed it on `dequeue`.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Entries currently waiting
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound, `None` when unbounded
    fn capacity(&self) -> Option<usize>;
}

/// Default in-process buffer
#[derive(Debug, Default)]
pub struct InMemoryBuffer {
    entries: Mutex<VecDeque<Vec<u8>>>,
    capacity: Option<usize>,
    items_available: Notify,
    space_available: Notify,
}

impl InMemoryBuffer {
    /// Unbounded buffer
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Buffer holding at most `capacity` entries
    pub fn bounded(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::Configuration(
                "buffer capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            capacity: Some(capacity),
            ..Self::default()
        })
    }

    /// Build from an optional capacity, as found in `PublisherOptions`
    pub fn with_capacity(capacity: Option<usize>) -> Result<Self> {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Ok(Self::unbounded()),
        }
    }

    fn has_space(&self, len: usize) -> bool {
        self.capacity.map(|cap| len < cap).unwrap_or(true)
    }
}

#[async_trait]
impl PublisherBuffer for InMemoryBuffer {
    async fn enqueue(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        let mut payload = Some(payload);
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut entries = self.entries.lock();
                if self.has_space(entries.len()) {
                    if let Some(payload) = payload.take() {
                        entries.push_back(payload);
                    }
                    drop(entries);
                    self.items_available.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let notified = self.items_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.entries.lock().pop_front();
            if let Some(payload) = next {
                self.space_available.notify_waiters();
                return Ok(payload);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    fn requeue_front(&self, payload: Vec<u8>) -> Result<()> {
        self.entries.lock().push_front(payload);
        self.items_available.notify_waiters();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
