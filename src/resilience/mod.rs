//! Fixed-delay retry used for per-recipient WhatsApp text sends.
//!
//! Every failure is retried, regardless of kind, until the attempt budget is
//! spent; the last error is returned.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::WhatsAppConfig;

/// Attempt budget and inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Treated as at least 1.
    pub max_attempts: u32,
    /// Fixed sleep between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl From<&WhatsAppConfig> for RetryPolicy {
    fn from(config: &WhatsAppConfig) -> Self {
        Self::new(config.text_attempts, config.text_retry_delay)
    }
}

/// Retry executor with a fixed delay.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a new retry executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "Retrying operation after failure"
                    );
                    attempt += 1;
                    sleep(self.policy.delay).await;
                }
            }
        }
    }
}
