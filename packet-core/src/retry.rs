//! Retry policy - bounded exponential backoff with jitter for transient
//! store errors

use crate::{config::RetryConfig, Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retries operations that fail with retryable errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Calculate delay for nth retry with exponential backoff + jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation`, retrying retryable failures up to `max_retries` times.
    ///
    /// Non-retryable errors are returned as-is. When the budget runs out the
    /// last error is surfaced as [`Error::ServiceUnavailable`].
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if attempt >= self.config.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            error = %e,
                            "Retry budget exhausted"
                        );
                        return Err(Error::ServiceUnavailable(format!(
                            "{} failed after {} attempts: {}",
                            operation_name,
                            attempt + 1,
                            e
                        )));
                    }
                    let delay = self.calculate_delay(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
