//! Fixed-delay retry for handler boundaries and outbound sends.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Single attempt, no delay.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted, sleeping `policy.delay`
/// between attempts. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                warn!(operation = name, attempt, error = %e, "operation failed");
                info!(
                    "⏳ Retrying {} {}/{} in {:?}...",
                    name, attempt, policy.max_attempts, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    operation = name,
                    attempts = attempt,
                    error = %e,
                    "💥 operation failed after all retries"
                );
                return Err(e);
            }
        }
    }
}
