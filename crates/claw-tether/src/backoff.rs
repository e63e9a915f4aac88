//! Reconnection backoff strategies and retry bookkeeping.
//!
//! Reconnection is indefinite by default: with `max_attempts: None` a network
//! partition is retried forever, until the owner calls
//! [`ConnectionManager::close`](crate::manager::ConnectionManager::close).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Maps a retry attempt number to the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay: `base`.
    #[default]
    Constant,
    /// `base * attempt`, capped at the maximum delay.
    Linear,
    /// `base * multiplier^(attempt - 1)`, capped at the maximum delay.
    Exponential,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// How delays grow with the attempt number.
    pub strategy: BackoffStrategy,
    /// Base delay fed into the strategy.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Maximum number of reconnection attempts (None = infinite).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Constant,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for the given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Linear => self
                .base_delay
                .saturating_mul(attempt.max(1))
                .min(self.max_delay),
            BackoffStrategy::Exponential => calculate_backoff(
                attempt,
                self.base_delay,
                self.max_delay,
                self.backoff_multiplier,
            ),
        }
    }

    /// Check if we should attempt reconnection.
    #[must_use]
    pub const fn should_reconnect(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Calculate reconnection delay using exponential backoff.
#[must_use]
pub fn calculate_backoff(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
) -> Duration {
    let factor = multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
    let delay_millis = initial_delay.as_millis() as f64 * factor;
    if !delay_millis.is_finite() || delay_millis >= max_delay.as_millis() as f64 {
        return max_delay;
    }
    Duration::from_millis(delay_millis as u64).min(max_delay)
}

/// Retry bookkeeping for the reconnect loop.
///
/// Reset to zero on every successful open, strictly increasing while
/// reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryAttempt {
    /// Number of consecutive failed attempts.
    pub attempt_number: u32,
    /// Delay scheduled before the next attempt, in milliseconds.
    pub next_delay_ms: u64,
}

impl RetryAttempt {
    /// Record a failed attempt and compute the delay before the next one.
    pub fn record_failure(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempt_number = self.attempt_number.saturating_add(1);
        let delay = config.delay_for_attempt(self.attempt_number);
        self.next_delay_ms = delay.as_millis() as u64;
        delay
    }

    /// Forget all failures after a successful open.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Attempt an operation repeatedly, sleeping between failures.
///
/// Used for one-shot setup work (the `tether` CLI resolves credentials with it);
/// the connection manager runs its own loop so it can publish each attempt.
pub async fn reconnect_with_backoff<F, Fut, T, E>(
    config: &ReconnectConfig,
    mut connect_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = RetryAttempt::default();

    loop {
        match connect_fn().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !config.should_reconnect(retry.attempt_number + 1) {
                    return Err(e);
                }

                let delay = retry.record_failure(config);
                sleep(delay).await;
            }
        }
    }
}
