//! Bounded retry with exponential, jittered backoff.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_percent: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            factor: 2.0,
            jitter_percent: 0.20,
            max_ms: 2000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt + 1`, with jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        // base * factor^attempt, capped
        let exp = attempt.min(i32::MAX as u32) as i32;
        let base_backoff = (self.base_ms as f64 * self.factor.powi(exp)).min(self.max_ms as f64);

        // ±jitter_percent
        let jitter_range = base_backoff * self.jitter_percent.abs();
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let backoff_ms = (base_backoff + jitter).max(0.0) as u64;
        Duration::from_millis(backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Result<Self> {
        if max_attempts == 0 {
            return Err(TelemetryError::construction(
                "retry attempts must be greater than 0",
            ));
        }
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `timeout` bounds all attempts and backoff
    /// sleeps together.
    ///
    /// `op` receives the zero-based attempt number. On exhaustion the last
    /// attempt's error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TelemetryError::Cancelled),
                outcome = tokio::time::timeout_at(deadline, op(attempt)) => outcome,
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(TelemetryError::Timeout(timeout)),
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let backoff = self.backoff.calculate_backoff(attempt - 1);
            if Instant::now() + backoff >= deadline {
                debug!(attempt, error = %err, "no time left for another attempt");
                return Err(err);
            }
            debug!(attempt, ?backoff, error = %err, "backing off before retry");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TelemetryError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: BackoffConfig::default(),
        }
    }
}
