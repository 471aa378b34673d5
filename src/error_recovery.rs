//! Bounded retry of failed grabs.
//
// A failed grab is retried against the same pending trigger. The controller is
// still waiting for its acknowledgment, so a retry never skips a stage position.
// Once the budget is spent the failure becomes fatal for the run.

use crate::error::{AppResult, CaptureError, GrabError};
use std::time::Duration;

/// Defines a policy for retrying a failed grab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_retries` extra attempts and the default backoff.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Total attempts per step, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Start counting attempts for `step`.
    pub fn begin(&self, step: u32) -> StepAttempts {
        StepAttempts {
            step,
            failures: 0,
            max_attempts: self.max_attempts(),
            backoff_delay: self.backoff_delay,
        }
    }
}

/// Attempts spent on one step.
#[derive(Debug, Clone)]
pub struct StepAttempts {
    step: u32,
    failures: u32,
    max_attempts: u32,
    backoff_delay: Duration,
}

impl StepAttempts {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt.
    ///
    /// Returns the backoff to wait before the next attempt, or
    /// `CaptureError::GrabRetriesExhausted` once no attempt is left.
    pub fn record_failure(&mut self, error: GrabError) -> AppResult<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return Err(CaptureError::GrabRetriesExhausted {
                step: self.step,
                attempts: self.failures,
                last: error,
            });
        }
        Ok(self.backoff_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_one_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 2);

        let mut attempts = policy.begin(3);
        let backoff = attempts
            .record_failure(GrabError::Timeout(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(backoff, Duration::from_millis(100));

        match attempts.record_failure(GrabError::Failed("sensor busy".into())) {
            Err(CaptureError::GrabRetriesExhausted {
                step,
                attempts,
                last,
            }) => {
                assert_eq!(step, 3);
                assert_eq!(attempts, 2);
                assert_eq!(last, GrabError::Failed("sensor busy".into()));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_retries_fails_on_first_error() {
        let mut attempts = RetryPolicy::with_max_retries(0).begin(1);
        let result = attempts.record_failure(GrabError::Timeout(Duration::from_secs(5)));
        assert!(matches!(
            result,
            Err(CaptureError::GrabRetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(attempts.failures(), 1);
    }

    #[test]
    fn test_budget_is_per_step() {
        let policy = RetryPolicy::with_max_retries(2);
        let mut first = policy.begin(1);
        assert!(first.record_failure(GrabError::Failed("x".into())).is_ok());
        assert!(first.record_failure(GrabError::Failed("x".into())).is_ok());

        let mut second = policy.begin(2);
        assert_eq!(second.failures(), 0);
        assert!(second.record_failure(GrabError::Failed("x".into())).is_ok());
    }
}
