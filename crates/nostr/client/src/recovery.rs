//! Reconnection backoff with optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy of a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "crate::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    #[serde(with = "crate::duration_ms")]
    pub max_delay: Duration,
    /// Retries before giving up (0 = unlimited)
    pub max_attempts: u32,
    /// Random spread applied to every delay, as a ratio in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Infinite
            jitter: 0.1,
        }
    }
}

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Jitter {
    /// No jitter; always return the capped exponential delay.
    None,
    /// Spread the capped delay uniformly over `delay * (1 ± ratio)`.
    Ratio(f64),
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff sequence.
    ///
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts != 0).then_some(max_attempts),
            jitter: Jitter::None,
            attempt: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        let jitter = if config.jitter > 0.0 {
            Jitter::Ratio(config.jitter.min(1.0))
        } else {
            Jitter::None
        };
        Self::new(config.initial_delay, config.max_delay, config.max_attempts).with_jitter(jitter)
    }

    /// Override the jitter strategy (defaults to `None`).
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence.
    ///
    /// Returns `None` if the backoff is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        // capped = min(base * 2^attempt, max_delay)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = u64::try_from(capped_ms).unwrap_or(u64::MAX);

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Ratio(ratio) => {
                let spread = (capped_ms as f64 * ratio) as u64;
                let low = capped_ms.saturating_sub(spread);
                let high = capped_ms.saturating_add(spread);
                rand::rng().random_range(low..=high)
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    /// Reset the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt count (number of delays generated so far).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the backoff has reached its maximum attempts.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
