//! Bounded retry with exponential backoff for transient remote failures.
//!
//! Remote calls made while driving an occurrence to live (broadcast API,
//! token endpoint) can fail with rate limits, timeouts, or 5xx responses
//! that resolve on their own. Those are retried here a small, bounded
//! number of times; anything classified as permanent is returned to the
//! caller immediately so the occurrence can fail fast and be torn down.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Retry policy for transient remote errors.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Runs `operation`, retrying while it returns an error for which
/// [`Error::is_transient`] holds. Permanent errors and exhaustion both
/// surface the last error unchanged.
pub async fn retry_transient<T, F, Fut>(
    operation_name: &str,
    config: &BackoffConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt + 1 < config.max_attempts => {
                let exponential = config
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt));
                let capped = exponential.min(config.max_delay);
                let jitter_range = capped.as_millis() as u64 / 4 + 1;
                let delay = capped + Duration::from_millis(random::<u64>() % jitter_range);

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
