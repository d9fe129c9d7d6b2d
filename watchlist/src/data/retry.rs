//! Bounded retries with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::ProviderError;

/// Retry budget for one external call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let hinted = match err {
            ProviderError::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => Duration::ZERO,
        };
        (backoff + jitter).max(hinted).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-recoverable error, or the
/// attempt budget runs out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_recoverable() => {
                debug!(call = %label, error = %err, "Non-recoverable error, not retrying");
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(call = %label, attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt, &err);
                debug!(
                    call = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(4), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Unavailable("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(4), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::RateLimited { retry_after_secs: None }) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
