//! Cooperative cancellation shared by the background loops and the
//! blocking buffer operations.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal backed by a `watch` channel
///
/// Every clone observes the same flag. Once cancelled a token stays
/// cancelled.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new, not yet cancelled, token
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// A token that is never cancelled by anyone else
    pub fn none() -> Self {
        Self::new()
    }

    /// Signal cancellation to every clone
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Check the flag without waiting
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside every clone, so `changed` only errors
        // once all of them are gone, at which point nobody can cancel.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
