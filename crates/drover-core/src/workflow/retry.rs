//! Bounded retry directives for failed steps.
//!
//! Stateless: the run snapshot tracks attempt counts, this module only
//! decides what the scheduler does next. Two retry shapes exist: re-queue
//! the failing step by itself, or loop back to an earlier step so the
//! whole span re-executes (used when a step's inputs, not the step, are
//! suspect).

use drover_types::workflow::RetryPolicy;

// ---------------------------------------------------------------------------
// RetryDirective
// ---------------------------------------------------------------------------

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDirective {
    /// Re-queue the failing step for another attempt.
    Requeue,
    /// Rewind to an earlier step and re-run the span from there.
    Loopback { target: String },
    /// Budget exhausted: mark the step failed.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decision logic.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed.
    ///
    /// `attempts` is 1-based: the count of executions already made,
    /// including the one that just failed.
    pub fn should_retry(policy: &RetryPolicy, attempts: u32) -> bool {
        attempts < policy.max_attempts
    }

    /// Decide the next action for a step whose attempt just failed.
    ///
    /// Steps without a retry policy get a single attempt.
    pub fn on_failure(policy: Option<&RetryPolicy>, attempts: u32) -> RetryDirective {
        let Some(policy) = policy else {
            return RetryDirective::GiveUp;
        };
        if !Self::should_retry(policy, attempts) {
            return RetryDirective::GiveUp;
        }
        match &policy.loopback_to {
            Some(target) => RetryDirective::Loopback {
                target: target.clone(),
            },
            None => RetryDirective::Requeue,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, loopback_to: Option<&str>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            loopback_to: loopback_to.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_no_policy_gives_up_immediately() {
        assert_eq!(RetryHandler::on_failure(None, 1), RetryDirective::GiveUp);
    }

    #[test]
    fn test_requeue_within_budget() {
        let p = policy(3, None);
        assert_eq!(RetryHandler::on_failure(Some(&p), 1), RetryDirective::Requeue);
        assert_eq!(RetryHandler::on_failure(Some(&p), 2), RetryDirective::Requeue);
    }

    #[test]
    fn test_gives_up_at_budget() {
        let p = policy(3, None);
        assert_eq!(RetryHandler::on_failure(Some(&p), 3), RetryDirective::GiveUp);
        assert_eq!(RetryHandler::on_failure(Some(&p), 4), RetryDirective::GiveUp);
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let p = policy(1, None);
        assert!(!RetryHandler::should_retry(&p, 1));
        assert_eq!(RetryHandler::on_failure(Some(&p), 1), RetryDirective::GiveUp);
    }

    #[test]
    fn test_loopback_directive_names_target() {
        let p = policy(2, Some("fetch"));
        assert_eq!(
            RetryHandler::on_failure(Some(&p), 1),
            RetryDirective::Loopback {
                target: "fetch".to_string()
            }
        );
        // Budget still applies to loopback retries.
        assert_eq!(RetryHandler::on_failure(Some(&p), 2), RetryDirective::GiveUp);
    }
}
