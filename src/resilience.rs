//! Resilience utilities: retry policy and bounded exponential backoff.
//!
//! - [`RetryConfig`]: attempt budget, backoff curve, per-attempt timeout
//! - [`retry_with_backoff`]: drive a fallible async operation under a [`RetryConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> article_sync::Result<()> {
//! use article_sync::resilience::{retry_with_backoff, RetryConfig};
//!
//! let value = retry_with_backoff("fetch", &RetryConfig::startup(), |_attempt| async {
//!     Ok::<_, article_sync::SyncError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Bounded retry for startup connectivity (broker and target store).
    ///
    /// Exhausting it is fatal: the process exits non-zero.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay after failure
    /// -------  -------------------
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// 4        8s
    /// 5        (give up)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for polling a running consumer group.
    ///
    /// 1s doubling, capped at 60s. A broker outage mid-run never kills the
    /// loop; it waits for the broker to come back.
    pub fn polling() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Publish budget: 3 attempts, 1s then 2s between them, 10s per send.
    pub fn producer() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent; past 2^62 everything is max_delay anyway.
        let exponent = (attempt - 1).min(62) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Run `f` until it succeeds, the error is not retryable, or the attempt
/// budget is spent.
///
/// Each attempt is bounded by `config.connection_timeout`; a timed-out
/// attempt counts as a retryable failure. `f` receives the 1-indexed attempt
/// number. On exhaustion the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut f: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match timeout(config.connection_timeout, f(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => SyncError::Timeout {
                operation: operation.to_string(),
                after: config.connection_timeout,
            },
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt >= config.max_attempts {
            error!(operation, attempt, error = %err, "Giving up after max retries");
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
