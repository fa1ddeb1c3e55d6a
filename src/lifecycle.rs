//! Lifecycle state machine shared by the publisher and the subscriber.
//!
//! `Created → Started → Stopped`. Stopped is terminal; a stopped instance
//! cannot be restarted, a new one has to be built.

use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a publisher or subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Built and configured, not yet connected
    Created,
    /// Connected and running
    Started,
    /// Torn down
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Started => write!(f, "started"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Represents a lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe holder enforcing the legal transitions
#[derive(Debug)]
pub struct Lifecycle {
    component: String,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: Mutex::new(LifecycleState::Created),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// `Created → Started`; anything else is `InvalidState`
    pub fn begin_start(&self) -> Result<LifecycleTransition> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Created => {
                *state = LifecycleState::Started;
                Ok(self.transition(LifecycleState::Created, LifecycleState::Started))
            }
            other => Err(BrokerError::InvalidState(format!(
                "{} cannot be started from state '{}'",
                self.component, other
            ))),
        }
    }

    /// Roll a failed start back so the caller may try again
    pub fn abort_start(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Started {
            *state = LifecycleState::Created;
        }
    }

    /// Any state → `Stopped`. Returns `None` if already stopped.
    pub fn stop(&self) -> Option<LifecycleTransition> {
        let mut state = self.state.lock();
        let from = *state;
        if from == LifecycleState::Stopped {
            return None;
        }
        *state = LifecycleState::Stopped;
        Some(self.transition(from, LifecycleState::Stopped))
    }

    /// Fail unless the component is running
    pub fn ensure_started(&self, operation: &str) -> Result<()> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            other => Err(BrokerError::InvalidState(format!(
                "{} cannot {} in state '{}'",
                self.component, operation, other
            ))),
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> LifecycleTransition {
        tracing::info!(component = %self.component, from = %from, to = %to, "Lifecycle transition");
        LifecycleTransition {
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_created() {
        let lifecycle = Lifecycle::new("publisher");
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        let transition = lifecycle.begin_start().unwrap();
        assert_eq!(transition.from, LifecycleState::Created);
        assert_eq!(transition.to, LifecycleState::Started);

        assert!(matches!(lifecycle.begin_start(), Err(BrokerError::InvalidState(_))));
    }

    #[test]
    fn test_stopped_is_terminal() {
        let lifecycle = Lifecycle::new("subscriber");
        lifecycle.begin_start().unwrap();
        assert!(lifecycle.stop().is_some());
        assert!(lifecycle.stop().is_none());
        assert!(lifecycle.begin_start().is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_ensure_started() {
        let lifecycle = Lifecycle::new("publisher");
        assert!(lifecycle.ensure_started("produce").is_err());
        lifecycle.begin_start().unwrap();
        assert!(lifecycle.ensure_started("produce").is_ok());
    }

    #[test]
    fn test_abort_start_rolls_back() {
        let lifecycle = Lifecycle::new("publisher");
        lifecycle.begin_start().unwrap();
        lifecycle.abort_start();
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(lifecycle.begin_start().is_ok());
    }
}
