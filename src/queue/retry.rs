//! Retry of transient driver failures inside a queue worker

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::OrchestratorResult;

/// Exponential backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Delay before retry number `attempt` (1-based), with up to 10% jitter
pub fn next_retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(multiplier).min(max_ms);
    let jitter = if delay >= 10 {
        rand::random::<u64>() % (delay / 10)
    } else {
        0
    };
    Duration::from_millis(delay.saturating_add(jitter).min(max_ms))
}

/// Run `operation`, retrying while it fails with a transient error.
///
/// Non-transient errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = next_retry_delay(attempt, policy.base_delay_ms, policy.max_delay_ms);
                warn!(
                    "Operation '{}' failed. Retrying in {:?} (attempt {}/{}): {}",
                    operation_name, delay, attempt, policy.max_retries, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = next_retry_delay(1, 100, 10_000);
        let third = next_retry_delay(3, 100, 10_000);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(111));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(441));
        assert_eq!(next_retry_delay(30, 100, 1_000), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };

        let result = retry_transient("flaky", policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OrchestratorError::transient("reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: OrchestratorResult<()> = retry_transient("broken", RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OrchestratorError::driver("syntax error")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let result: OrchestratorResult<()> = retry_transient("down", policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OrchestratorError::transient("reset")) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
