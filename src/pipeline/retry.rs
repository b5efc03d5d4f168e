//! Bounded exponential backoff for remote calls.
//!
//! Only errors for which [`LlmError::is_retryable`] holds are retried. Any
//! other error ends the attempt sequence immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of calls, including the first.
    pub max_attempts: u32,
    /// Growth factor between consecutive delays.
    pub base: f64,
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Wall-clock budget for the whole attempt sequence.
    #[serde(with = "duration_secs")]
    pub max_elapsed: Duration,
    /// Draw each delay uniformly from zero to its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base: 2.0,
            initial_delay: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = budget;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Nominal delay after the given failed attempt (1-based), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.base.powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_elapsed.as_secs_f64()))
        } else {
            self.max_elapsed
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let secs = rand::rng().random_range(0.0..=nominal.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Final error of an attempt sequence.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: LlmError,
    pub attempts: u32,
}

impl RetryFailure {
    /// Whether the sequence ended because the retry ceiling or the time
    /// budget was reached while the error was still retryable.
    pub fn is_exhausted(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, reaches
/// `max_attempts`, or the time budget runs out.
///
/// Sleeps are truncated to the remaining budget, so the total elapsed time
/// exceeds the budget by at most the latency of the last call.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(RetryFailure {
                error,
                attempts: attempt,
            });
        }

        let elapsed = start.elapsed();
        if attempt >= max_attempts || elapsed >= policy.max_elapsed {
            warn!(
                attempts = attempt,
                elapsed_secs = elapsed.as_secs_f64(),
                error = %error,
                "Giving up after repeated rate limiting"
            );
            return Err(RetryFailure {
                error,
                attempts: attempt,
            });
        }

        let remaining = policy.max_elapsed - elapsed;
        let delay = policy.delay(attempt).min(remaining);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Rate limited, backing off"
        );
        MetricsCollector::new().record_retry();
        tokio::time::sleep(delay).await;
    }
}

/// Serde helper storing durations as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
