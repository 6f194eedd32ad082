//! Bounded retry with exponential backoff, jitter and per-call timeouts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryPolicy;

/// Delay before retry `attempt` (1-based): `base * 2^attempt + base * U(0,1)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let jitter = policy.base.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    exp.saturating_add(jitter)
}

/// Runs `fut` under `limit`; on expiry the error built by `on_timeout` is returned.
pub async fn with_timeout<T, E, F>(
    limit: Option<Duration>,
    fut: F,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(on_timeout(d)),
        },
        None => fut.await,
    }
}

/// Outcome of [`retry_with_backoff`] when every attempt failed or a failure
/// was not retryable.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts made, including the failing one.
    pub attempts: u32,
    pub error: E,
}

/// Calls `op` until it succeeds, `retryable` rejects the error, or
/// `policy.max_attempts` is reached. Sleeps [`backoff_delay`] between attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max && retryable(&e) => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    target: "geo_store::retry",
                    op = what,
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}
