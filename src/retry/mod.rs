//! Retry policy with exponential backoff.
//!
//! `max_retries` counts retries beyond the first attempt, so an operation
//! runs at most `max_retries + 1` times. Whether a failure is retried is
//! decided by the error's category against a configurable set; anything
//! outside the set propagates immediately. Cancellation wins over a pending
//! backoff and over further attempts.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::cancel::CancelToken;
use crate::core::errors::{ForemanError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Backoff growth factor per retry.
    pub multiplier: f64,
    /// Error categories eligible for retry; everything else is permanent.
    pub retryable_categories: HashSet<String>,
    /// Optional deadline applied to each individual attempt.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            retryable_categories: ["timeout", "rate_limit", "upstream", "io"]
                .into_iter()
                .map(String::from)
                .collect(),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(ForemanError::configuration(
                "retry multiplier must be at least 1.0",
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(ForemanError::configuration(
                "initial_delay cannot be zero",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ForemanError::configuration(
                "max_delay cannot be below initial_delay",
            ));
        }
        Ok(())
    }

    /// No retries at all; every failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn is_retryable(&self, error: &ForemanError) -> bool {
        self.retryable_categories.contains(error.category())
    }

    /// Backoff before retry number `attempt + 1`, capped at `max_delay`.
    /// The cap is applied in `f64` so a high attempt count cannot overflow
    /// the `Duration` conversion.
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powf(f64::from(attempt));
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Drive `operation` through the retry loop. The closure receives the
    /// zero-based attempt number. Cancellation interrupts a backoff sleep
    /// and prevents the next attempt; it never retroactively discards a
    /// result already produced.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            cancel.check(operation_name)?;

            let outcome = match self.attempt_timeout {
                Some(deadline) => match tokio::time::timeout(deadline, operation(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ForemanError::timeout(
                        operation_name,
                        deadline.as_millis() as u64,
                    )),
                },
                None => operation(attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_name,
                            attempt, "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if matches!(error, ForemanError::Cancelled { .. }) {
                return Err(error);
            }
            if !self.is_retryable(&error) {
                debug!(
                    operation = operation_name,
                    category = error.category(),
                    "Permanent failure, not retrying"
                );
                return Err(error);
            }
            if attempt >= self.max_retries {
                warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation = operation_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(ForemanError::cancelled_with_reason(
                        operation_name,
                        "cancelled during retry backoff",
                    ));
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            multiplier: 0.5,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            max_delay: Duration::from_millis(1),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_stays_capped_at_high_attempt_counts() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 4.0,
            ..Default::default()
        };
        // 4^200 overflows any Duration; the cap must win anyway.
        assert_eq!(policy.delay_for(200), Duration::from_millis(2));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_exhaustion_with_steep_multiplier_returns_final_error() {
        let policy = RetryPolicy {
            max_retries: 50,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 4.0,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .execute("always_down", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ForemanError::upstream("backend", "503"))
                }
            })
            .await;

        assert!(matches!(result, Err(ForemanError::Upstream { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 51);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = fast_policy(3);
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute("flaky", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ForemanError::upstream("backend", "503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_runs_max_retries_plus_one_attempts() {
        let policy = fast_policy(2);
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .execute("always_down", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ForemanError::timeout("backend", 100))
                }
            })
            .await;

        assert!(matches!(result, Err(ForemanError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = fast_policy(5);
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .execute("broken_input", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ForemanError::validation("bad input"))
                }
            })
            .await;

        assert!(matches!(result, Err(ForemanError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(10)),
            ..fast_policy(1)
        };
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute("slow_then_fast", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(41)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 41);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            ..fast_policy(3)
        };
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<()> = policy
            .execute("stuck", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ForemanError::upstream("backend", "503"))
                }
            })
            .await;

        assert!(matches!(result, Err(ForemanError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_invokes() {
        let policy = fast_policy(3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .execute("never", &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(ForemanError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
