use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FailureClass;

/// Attempt cap plus exponential backoff (`base * 2^attempt`, capped at `max_delay_ms`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        let base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms.saturating_mul(32),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the zero-based `attempt` failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(ms)
    }

    /// Whether a failure of `class` on the zero-based `attempt` earns another try.
    pub fn should_retry(&self, attempt: u32, class: FailureClass) -> bool {
        class.is_retryable() && attempt.saturating_add(1) < self.attempts()
    }

    /// Runs `op` until it succeeds, fails with a non-retryable class or runs out of
    /// attempts. `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = classify(&err);
                    if !self.should_retry(attempt, class) {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, %class, ?delay, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(63), Duration::from_millis(500));
    }

    #[test]
    fn retry_predicate_honors_class_and_cap() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        assert!(policy.should_retry(0, FailureClass::TransientNetwork));
        assert!(policy.should_retry(1, FailureClass::TransientNetwork));
        assert!(!policy.should_retry(2, FailureClass::TransientNetwork));
        assert!(!policy.should_retry(0, FailureClass::ClientRejected));
        assert!(!policy.should_retry(0, FailureClass::RateLimited));
    }

    #[tokio::test]
    async fn run_stops_on_non_retryable() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), FailureClass> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FailureClass::ClientRejected) }
                },
                |class| *class,
            )
            .await;
        assert_eq!(result, Err(FailureClass::ClientRejected));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_retries_transient_until_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let result: Result<u32, FailureClass> = policy
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Err(FailureClass::TransientNetwork)
                    } else {
                        Ok(attempt)
                    }
                },
                |class| *class,
            )
            .await;
        assert_eq!(result, Ok(2));
    }
}
