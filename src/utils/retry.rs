//! Retry utilities for resilient store calls
//!
//! Exponential backoff shared by startup (connecting to the store) and lease
//! renewal, where retries must also stop before the lease runs out.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate delay for a given attempt using exponential backoff
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }
}

/// Execute an operation with retry logic and exponential backoff
///
/// Returns the last error once all retries are spent.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(attempt = attempt, error = %e, "Operation failed, retries exhausted");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "Operation failed, will retry"
                );
            }
        }

        attempt += 1;
        let delay = config.calculate_delay(attempt);
        debug!(
            attempt = attempt,
            delay_ms = delay.as_millis(),
            "Retrying operation after delay"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retry while `should_retry` accepts the error and the next attempt can
/// start before `deadline`
///
/// Gives up early, returning the last error, when the backoff delay would
/// cross the deadline. `max_retries` still caps the attempt count.
pub async fn with_retry_until<T, E, F, Fut, P>(
    config: &RetryConfig,
    deadline: Instant,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= config.max_retries {
            warn!(attempt = attempt, error = %err, "Retries exhausted");
            return Err(err);
        }

        attempt += 1;
        let delay = config.calculate_delay(attempt);
        if Instant::now() + delay >= deadline {
            warn!(
                attempt = attempt,
                error = %err,
                "Deadline reached before next retry"
            );
            return Err(err);
        }

        debug!(
            attempt = attempt,
            delay_ms = delay.as_millis(),
            error = %err,
            "Retrying before deadline"
        );
        tokio::time::sleep(delay).await;
    }
}
