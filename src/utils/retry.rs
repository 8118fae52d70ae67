//! Retry with exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::venues::VenueError;

/// Backoff policy for transient venue errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fixed backoff applied to 429 responses.
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            rate_limit_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based attempt that just failed).
    fn delay_for(&self, attempt: u32, err: &VenueError) -> Duration {
        if matches!(err, VenueError::RateLimited(_)) {
            return self.rate_limit_delay;
        }
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
        exp.min(self.max_delay)
    }
}

/// Run `f` with the policy. Auth, client, and rejection errors surface
/// immediately; network and rate-limit errors retry until attempts exhaust.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, &err);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| VenueError::Network("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            rate_limit_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_network_errors() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VenueError::Network("reset".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_retries_auth() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Auth("bad key".into())) }
        })
        .await;

        assert!(matches!(result, Err(VenueError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Network("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(VenueError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_growth_capped() {
        let policy = RetryPolicy::default();
        let err = VenueError::Network("x".into());
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3, &err), Duration::from_secs(2));
        // Capped at max_delay.
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(10));

        let rl = VenueError::RateLimited("429".into());
        assert_eq!(policy.delay_for(1, &rl), Duration::from_secs(2));
    }
}
