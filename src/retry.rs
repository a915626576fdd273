//! Bounded exponential backoff with per-attempt deadlines.
//!
//! Every suspension point of the pipeline (a registry or state-store call)
//! goes through [`with_retry`]: the call gets an explicit timeout, transient
//! failures are retried up to `max_attempts`, and everything else is returned
//! on the first occurrence.

use std::future::Future;
use std::time::Duration;

use crate::errors::Retryable;

/// Retry policy for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Deadline for each individual call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay. Used where a caller must not retry.
    pub fn once(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            call_timeout,
        }
    }

    /// Delay after the given (1-based) failed attempt: doubles each time, capped.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(operation, policy.call_timeout)),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.kind().is_transient() && attempt < attempts => {
                let delay = policy.backoff_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Classify, ErrorKind, PublishError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = fast_policy(6);
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(40), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<&str, PublishError> = with_retry(&fast_policy(3), "push", |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt == 1 {
                    Err(PublishError::Transient("503".into()))
                } else {
                    Ok("sha256:done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "sha256:done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), PublishError> = with_retry(&fast_policy(3), "push", |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PublishError::Transient("503".into()))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TransientPublishFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), PublishError> = with_retry(&fast_policy(5), "push", |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PublishError::Auth("401".into()))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::AuthFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let mut policy = fast_policy(2);
        policy.call_timeout = Duration::from_millis(50);
        let result: Result<(), PublishError> = with_retry(&policy, "exists", |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(())
        })
        .await;
        assert!(result.is_ok());
    }
}
