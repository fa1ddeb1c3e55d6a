//! Bounded exponential backoff used by the reconnect paths.

use crate::cancellation::CancellationToken;
use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Growth factor between consecutive attempts
    pub multiplier: f64,

    /// Randomizes each delay by +/- this fraction (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Fixed delay, no growth and no jitter
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(BrokerError::Configuration(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(BrokerError::Configuration(
                "backoff jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(BrokerError::Configuration(
                "backoff max_delay must not be below initial_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay for retry number `attempt` (1-based, attempt 0 is immediate)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, jitter_sample())
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0)`
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(63) as i32;
        let base_us = self.initial_delay.as_micros() as f64 * self.multiplier.powi(exponent);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        let offset = (jitter * 2.0 - 1.0) * base_us * self.jitter_factor;
        let final_us = (base_us + offset)
            .min(self.max_delay.as_micros() as f64)
            .max(0.0);

        Duration::from_micros(final_us as u64)
    }
}

/// Sleep for `delay` unless the token fires first
///
/// Returns `Err(BrokerError::Cancelled)` when interrupted.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BrokerError::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
    }
}

fn jitter_sample() -> f64 {
    rand::random::<f64>()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(config.delay_with_jitter(1, 0.5), Duration::from_millis(100));
        assert_eq!(config.delay_with_jitter(2, 0.5), Duration::from_millis(200));
        assert_eq!(config.delay_with_jitter(3, 0.5), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_bounded() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.5,
        };

        for attempt in 1..200 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_jitter_range() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.25,
        };

        assert_eq!(config.delay_with_jitter(1, 0.0), Duration::from_millis(75));
        assert_eq!(config.delay_with_jitter(1, 1.0), Duration::from_millis(125));
    }

    #[test]
    fn test_sampled_jitter_stays_in_window() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.25,
        };

        let samples: Vec<Duration> = (0..64).map(|_| config.delay_for_attempt(1)).collect();
        for delay in &samples {
            assert!(*delay >= Duration::from_millis(75) && *delay <= Duration::from_millis(125));
        }
        assert!(samples.iter().any(|d| *d != samples[0]), "jitter is randomized");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BackoffConfig::default();
        config.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = BackoffConfig::default();
        config.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        assert!(BackoffConfig::default().validate().is_ok());
        assert!(BackoffConfig::constant(Duration::from_millis(5)).validate().is_ok());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = sleep_or_cancel(Duration::from_secs(30), &cancel).await;
        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
