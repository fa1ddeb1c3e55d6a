//! Write-through publisher buffer backed by sled.
//!
//! Every payload is persisted before `enqueue` returns, so entries that
//! were never published survive a process restart and are drained by the
//! next publisher opening the same path. `dequeue` leaves the head entry on
//! disk; it is removed only by `commit` once the publish succeeded.

use super::buffer::PublisherBuffer;
use crate::cancellation::CancellationToken;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sled::Db;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const TREE_NAME: &str = "publisher_buffer";
const SIGN_BIT: u64 = 1 << 63;

/// Durable publisher buffer
pub struct SledBuffer {
    db: Arc<Db>,
    tree: sled::Tree,
    capacity: Option<usize>,
    /// Key of the entry handed out by `dequeue` and not yet committed.
    /// The lock also serializes key allocation at both ends of the tree.
    in_flight: Mutex<Option<sled::IVec>>,
    /// Entries on disk, in-flight one included
    count: AtomicUsize,
    items_available: Notify,
    space_available: Notify,
}

impl SledBuffer {
    /// Open or create an unbounded buffer at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_capacity(path, None)
    }

    /// Open or create a buffer at `path` with an optional bound
    pub fn open_with_capacity<P: AsRef<Path>>(path: P, capacity: Option<usize>) -> Result<Self> {
        if capacity == Some(0) {
            return Err(BrokerError::Configuration(
                "buffer capacity must be greater than zero".to_string(),
            ));
        }

        let db = sled::open(path.as_ref()).map_err(|e| {
            BrokerError::Storage(format!("Failed to open sled database: {}", e))
        })?;
        let tree = db.open_tree(TREE_NAME).map_err(|e| {
            BrokerError::Storage(format!("Failed to open buffer tree: {}", e))
        })?;

        let pending = tree.len();
        tracing::info!(path = ?path.as_ref(), pending, "Opened durable publisher buffer");

        Ok(Self {
            db: Arc::new(db),
            tree,
            capacity,
            in_flight: Mutex::new(None),
            count: AtomicUsize::new(pending),
            items_available: Notify::new(),
            space_available: Notify::new(),
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| BrokerError::Storage(format!("Failed to flush buffer: {}", e)))?;
        Ok(())
    }

    fn encode_key(seq: i64) -> [u8; 8] {
        ((seq as u64) ^ SIGN_BIT).to_be_bytes()
    }

    fn decode_key(key: &[u8]) -> Result<i64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| BrokerError::Storage(format!("Corrupt buffer key of {} bytes", key.len())))?;
        Ok((u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64)
    }

    fn edge_seq(entry: sled::Result<Option<(sled::IVec, sled::IVec)>>) -> Result<Option<i64>> {
        let entry = entry
            .map_err(|e| BrokerError::Storage(format!("Failed to read buffer bounds: {}", e)))?;
        entry.map(|(key, _)| Self::decode_key(&key)).transpose()
    }

    /// Append at the tail if there is room; hands the payload back otherwise
    fn try_push_back(&self, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let _guard = self.in_flight.lock();
        if let Some(cap) = self.capacity {
            if self.count.load(Ordering::Acquire) >= cap {
                return Ok(Some(payload));
            }
        }

        let seq = Self::edge_seq(self.tree.last())?.map(|s| s + 1).unwrap_or(0);
        self.tree
            .insert(Self::encode_key(seq), payload)
            .map_err(|e| BrokerError::Storage(format!("Failed to persist payload: {}", e)))?;
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(None)
    }

    /// Hand out the head entry without removing it
    fn try_peek_front(&self) -> Result<Option<Vec<u8>>> {
        let mut in_flight = self.in_flight.lock();
        let entry = self
            .tree
            .first()
            .map_err(|e| BrokerError::Storage(format!("Failed to read payload: {}", e)))?;
        Ok(entry.map(|(key, value)| {
            *in_flight = Some(key);
            value.to_vec()
        }))
    }
}

impl std::fmt::Debug for SledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBuffer")
            .field("len", &self.count.load(Ordering::Acquire))
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl PublisherBuffer for SledBuffer {
    async fn enqueue(&self, payload: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        let mut pending = payload;
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push_back(pending)? {
                None => {
                    self.flush().await?;
                    self.items_available.notify_waiters();
                    return Ok(());
                }
                Some(rejected) => pending = rejected,
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

            if let Some(payload) = self.try_peek_front()? {
                return Ok(payload);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    /// Requeuing while an entry is in flight releases that entry, which
    /// never left the head of the tree. Otherwise the payload is inserted
    /// ahead of the current head.
    fn requeue_front(&self, payload: Vec<u8>) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.take().is_none() {
                let seq = Self::edge_seq(self.tree.first())?.map(|s| s - 1).unwrap_or(0);
                self.tree
                    .insert(Self::encode_key(seq), payload)
                    .map_err(|e| BrokerError::Storage(format!("Failed to requeue payload: {}", e)))?;
                self.count.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.items_available.notify_waiters();
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock();
            let Some(key) = in_flight.take() else {
                return Ok(());
            };
            let removed = self
                .tree
                .remove(&key)
                .map_err(|e| BrokerError::Storage(format!("Failed to remove payload: {}", e)))?;
            if removed.is_some() {
                self.count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.space_available.notify_waiters();
        Ok(())
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
