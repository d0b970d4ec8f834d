// Bounded retry with a fixed inter-attempt delay.
//
// Wraps an async operation: on failure sleep `wait`, retry, up to
// `max_attempts` total invocations. No backoff; the final failure's error
// is returned as-is and success short-circuits immediately.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry parameters: total attempt count and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, wait: Duration::from_millis(100) }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` clamped to at least one attempt.
    pub const fn new(max_attempts: u32, wait: Duration) -> Self {
        let max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        Self { max_attempts, wait }
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(policy, op, |_| true).await
}

/// Like [`with_retry`], but only errors for which `should_retry` returns
/// true consume further attempts; others surface immediately (credential
/// rejections, malformed responses).
pub async fn with_retry_if<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= attempts || !should_retry(&error) => return Err(error),
            Err(error) => {
                debug!(%error, attempt, max_attempts = attempts, "attempt failed, retrying");
                tokio::time::sleep(policy.wait).await;
                attempt += 1;
            }
        }
    }
}
