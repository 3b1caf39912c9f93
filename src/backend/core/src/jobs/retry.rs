//! Retry policy and the controller that applies it to failed attempts.
//!
//! The retry decision is a pure function of `(attempts, max_attempts)`; the
//! delay is a pure function of `attempts`. The controller only applies the
//! decision to the store and the queue.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::queue::JobQueue;
use super::store::JobStore;
use super::{JobError, JobId};
use crate::error::Result;
use crate::telemetry::metrics::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Linear increase in delay (initial + increment * (attempt - 1))
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay (initial * multiplier^(attempt - 1))
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after the given failed attempt (1-indexed).
    ///
    /// Attempt `0` is treated as attempt `1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32);

        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial_delay,
                increment,
            } => initial_delay.saturating_add(increment.saturating_mul(exponent)),
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let nanos = initial_delay.as_nanos() as f64 * multiplier.powi(exponent as i32);
                let capped = nanos.min(max_delay.as_nanos() as f64).min(u64::MAX as f64);
                Duration::from_nanos(capped.round() as u64)
            }
        }
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create an exponential backoff strategy with a one hour cap.
    pub fn exponential(initial_delay: Duration, multiplier: f64) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay: Duration::from_secs(3600),
            multiplier,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the job after `delay`
    Retry { delay: Duration },
    /// Attempts are exhausted; the job fails permanently
    GiveUp,
}

/// Configuration for job retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts a job gets when the submitter does not specify any
    pub default_max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            backoff: BackoffStrategy::exponential(initial_delay, multiplier),
            ..Default::default()
        }
    }

    /// Set the default attempt ceiling.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Decide what happens after attempt number `attempts` failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts < max_attempts {
            RetryDecision::Retry {
                delay: self.backoff.delay_for_attempt(attempts),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Get the delay before the next retry.
    pub fn next_retry_delay(&self, attempts: u32) -> Duration {
        self.backoff.delay_for_attempt(attempts)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Controller
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies the retry policy to a failed attempt.
pub struct RetryController {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(store: Arc<JobStore>, queue: Arc<JobQueue>, policy: RetryPolicy) -> Self {
        Self {
            store,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handle a failed attempt of a job currently in `Running`.
    ///
    /// Non-retryable errors fail the job immediately. Otherwise the job is
    /// moved to `Retrying` and re-enqueued after the backoff delay, or moved
    /// to `Failed` once its attempts are exhausted.
    pub fn on_failure(&self, job_id: JobId, error: &JobError) -> Result<RetryDecision> {
        let record = self.store.get(job_id)?;

        let decision = if error.retryable {
            self.policy.decide(record.attempts, record.max_attempts)
        } else {
            RetryDecision::GiveUp
        };

        match decision {
            RetryDecision::Retry { delay } => {
                self.store.schedule_retry(job_id, &error.message, delay)?;
                self.queue.enqueue_delayed(job_id, delay)?;
                JobMetrics::retried(&record.job_type);

                tracing::warn!(
                    job_id = %job_id,
                    job_type = %record.job_type,
                    attempt = record.attempts,
                    max_attempts = record.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job attempt failed, retry scheduled"
                );
            }
            RetryDecision::GiveUp => {
                let reason = if error.retryable {
                    format!(
                        "{} (gave up after {} of {} attempts)",
                        error.message, record.attempts, record.max_attempts
                    )
                } else {
                    format!("{} (not retryable)", error.message)
                };
                self.store.fail(job_id, &error.message, &reason)?;
                JobMetrics::failed(&record.job_type, error.retryable);

                tracing::error!(
                    job_id = %job_id,
                    job_type = %record.job_type,
                    attempts = record.attempts,
                    retryable = error.retryable,
                    error = %error,
                    "Job failed permanently"
                );
            }
        }

        Ok(decision)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::NewJob;
    use crate::jobs::timer::DelayTimer;
    use crate::jobs::{JobState, Payload};

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(8));
        // Should cap at max
        assert_eq!(backoff.delay_for_attempt(11), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_exponential_fractional_base() {
        let backoff = BackoffStrategy::exponential(Duration::from_millis(100), 3.0);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(900));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial_delay: Duration::from_secs(5),
            increment: Duration::from_secs(3),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(11));
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            multiplier: 10.0,
        };
        assert_eq!(
            backoff.delay_for_attempt(u32::MAX),
            Duration::from_nanos(u64::MAX)
        );
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0);

        assert_eq!(
            policy.decide(1, 3),
            RetryDecision::Retry { delay: Duration::from_secs(2) }
        );
        assert_eq!(
            policy.decide(2, 3),
            RetryDecision::Retry { delay: Duration::from_secs(4) }
        );
        assert_eq!(policy.decide(3, 3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, 1), RetryDecision::GiveUp);
    }

    fn fixture(policy: RetryPolicy) -> (Arc<JobStore>, Arc<JobQueue>, RetryController) {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new(Arc::new(DelayTimer::new())));
        let controller = RetryController::new(store.clone(), queue.clone(), policy);
        (store, queue, controller)
    }

    fn running_job(store: &JobStore, max_attempts: u32) -> JobId {
        let record = store.create(NewJob::new("flaky", Payload::new(), max_attempts));
        store.begin_attempt(record.id).unwrap();
        record.id
    }

    #[tokio::test]
    async fn test_on_failure_schedules_retry() {
        let (store, queue, controller) =
            fixture(RetryPolicy::exponential(Duration::from_secs(60), 2.0));
        let id = running_job(&store, 3);

        let decision = controller
            .on_failure(id, &JobError::retryable("smtp down"))
            .unwrap();

        assert_eq!(decision, RetryDecision::Retry { delay: Duration::from_secs(60) });
        let record = store.get(id).unwrap();
        assert_eq!(record.state, JobState::Retrying);
        assert_eq!(record.last_error.as_deref(), Some("smtp down"));
        assert_eq!(queue.stats().delayed, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_on_failure_gives_up_when_exhausted() {
        let (store, queue, controller) = fixture(RetryPolicy::default());
        let id = running_job(&store, 1);

        let decision = controller
            .on_failure(id, &JobError::retryable("boom"))
            .unwrap();

        assert_eq!(decision, RetryDecision::GiveUp);
        let record = store.get(id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(queue.stats().delayed, 0);
    }

    #[tokio::test]
    async fn test_on_failure_fatal_error_is_not_retried() {
        let (store, _queue, controller) = fixture(RetryPolicy::default());
        let id = running_job(&store, 5);

        let decision = controller
            .on_failure(id, &JobError::fatal("bad payload"))
            .unwrap();

        assert_eq!(decision, RetryDecision::GiveUp);
        let record = store.get(id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 1);
    }
}
