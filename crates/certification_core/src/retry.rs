use std::time::Duration;

use crate::clock::Clock;
use crate::error::WorkflowError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 8_000;

/// Capped exponential backoff for transient collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// `min(initial * 2^attempt, max)`, with `attempt` counted from zero.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Runs `operation` until it succeeds, fails with anything other than
/// `UpstreamUnavailable`, or the attempt budget is spent.
pub fn retry_upstream<T>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut operation: impl FnMut() -> Result<T, WorkflowError>,
) -> Result<T, WorkflowError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match operation() {
            Err(error @ WorkflowError::UpstreamUnavailable { .. }) if attempt + 1 < attempts => {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    component = "retry",
                    event = "upstream_retry_scheduled",
                    attempt = attempt + 1,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                );
                clock.sleep(backoff);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::Collaborator;
    use crate::test_helpers::ManualClock;

    fn unavailable() -> WorkflowError {
        WorkflowError::UpstreamUnavailable {
            collaborator: Collaborator::PropertyRegistry,
            reason: "timeout".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(9), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(80), Duration::from_secs(8));
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let clock = ManualClock::at_epoch();
        let calls = Cell::new(0);
        let result = retry_upstream(&RetryPolicy::default(), &clock, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(unavailable())
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result, Ok(3));
        assert_eq!(clock.slept(), Duration::from_secs(3));
    }

    #[test]
    fn gives_up_after_attempt_budget() {
        let clock = ManualClock::at_epoch();
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_upstream(&RetryPolicy::default(), &clock, || {
            calls.set(calls.get() + 1);
            Err(unavailable())
        });

        assert_eq!(result, Err(unavailable()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_validation_failures() {
        let clock = ManualClock::at_epoch();
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_upstream(&RetryPolicy::default(), &clock, || {
            calls.set(calls.get() + 1);
            Err(WorkflowError::validation(
                crate::state::Step::ValidateOtp,
                "wrong code",
            ))
        });

        assert!(matches!(
            result,
            Err(WorkflowError::ValidationFailure { .. })
        ));
        assert_eq!(calls.get(), 1);
        assert_eq!(clock.slept(), Duration::ZERO);
    }
}
