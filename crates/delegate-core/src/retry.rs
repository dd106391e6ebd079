//! Exponential backoff for transient failures.
//!
//! Only errors classified retryable by [`DelegateError::is_retryable`]
//! are retried; validation, conflict, and not-found errors surface on the
//! first attempt. Delays grow by the multiplier up to the cap, with a
//! little jitter so synchronized callers fan out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::DelegateConfig;
use crate::error::DelegateError;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl From<&DelegateConfig> for BackoffPolicy {
    fn from(config: &DelegateConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Default::default()
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry (attempt is 1-based: the delay after
    /// the first failure is `delay_for_attempt(1)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_delay.as_millis() as f64 * exp;
        let capped = base.min(self.max_delay.as_millis() as f64);
        // Up to 10% jitter.
        let jitter = capped * rand::rng().random_range(0.0..0.1);
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// Run `op` with retries per `policy`.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, DelegateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DelegateError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
