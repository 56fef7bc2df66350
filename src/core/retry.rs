//! Retry wrapper for scheduled jobs.
//!
//! A job body is retried with exponential backoff and equal jitter while its error is
//! retryable. Anything else, or the last failure once attempts run out, goes to a recovery
//! hook and is returned to the caller.

use crate::{
    config::settings::RetrySettings,
    errors::{Error, Result},
};
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::{error, info, warn};

/// Backoff configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3 (the first try included)
/// - `base_delay`: 1 second
/// - `max_delay`: 30 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Cap for the exponential delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from the `[retry]` settings section.
    #[must_use]
    pub const fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// [`Self::delay_for_attempt`] with equal jitter: half fixed, half uniformly random.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let half = self.delay_for_attempt(attempt) / 2;
        let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Default retry predicate: only concurrency failures are worth another attempt.
#[must_use]
pub fn is_retryable(err: &Error) -> bool {
    err.is_retryable()
}

/// Default recovery hook: records the permanent failure for an operator.
pub fn log_recovery(job: &str, err: &Error) {
    error!(
        job,
        kind = ?err.kind(),
        error = %err,
        "job failed permanently, manual recovery may be needed"
    );
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out of attempts.
///
/// `recover` is called exactly once with the final error before it is returned; it is not
/// called on success.
pub async fn run_with_retry<T, F, Fut, P, R>(
    job: &str,
    policy: &RetryPolicy,
    retryable: P,
    mut op: F,
    recover: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
    R: FnOnce(&str, &Error),
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(job, attempt, "job succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts && retryable(&err) => {
                let delay = policy.jittered_delay(attempt);
                warn!(
                    job,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "job failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                recover(job, &err);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_in_upper_half(attempt in 1u32..40) {
            let policy = RetryPolicy::default();
            let full = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay(attempt);
            prop_assert!(jittered >= full / 2);
            prop_assert!(jittered <= full);
            prop_assert!(full <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn test_retries_concurrency_until_success() -> Result<()> {
        let calls = AtomicU32::new(0);
        let recovered = AtomicU32::new(0);

        let value = run_with_retry(
            "test",
            &fast_policy(),
            is_retryable,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::concurrency("locked"))
                } else {
                    Ok(7)
                }
            },
            |_, _| {
                recovered.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recovered.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let recovered = AtomicU32::new(0);

        let result: Result<()> = run_with_retry(
            "test",
            &fast_policy(),
            is_retryable,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::concurrency("still locked"))
            },
            |job, err| {
                assert_eq!(job, "test");
                assert!(err.is_retryable());
                recovered.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Concurrency { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consistency_errors_go_straight_to_recovery() {
        let calls = AtomicU32::new(0);
        let recovered = AtomicU32::new(0);

        let result: Result<()> = run_with_retry(
            "aggregation",
            &fast_policy(),
            is_retryable,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::consistency("claimed 3 finished 2"))
            },
            |_, _| {
                recovered.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Consistency { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }
}
