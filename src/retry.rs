//! Deciding what happens to a job after a failed execution.

use crate::errors::ValidationError;
use crate::schema::{Job, checked_attempts};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Attempt metadata handed to backoff functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Attempts made so far, including the one that just failed.
    pub attempts: i16,
    /// Attempts allowed before the job fails permanently.
    pub max_attempts: i16,
    /// When the failed attempt was scheduled to run.
    pub run_at: Option<DateTime<Utc>>,
}

/// Maps the current time and attempt metadata to the next run time.
pub type BackoffFn = Arc<dyn Fn(DateTime<Utc>, &RetryAttempt) -> DateTime<Utc> + Send + Sync>;

/// Per-job-type retry overrides.
///
/// Returning `None` from either method falls back to the configured default.
pub trait RetryPolicy: Send + Sync {
    /// Attempts allowed before the job fails permanently.
    fn max_attempts(&self) -> Option<i16> {
        None
    }

    /// When to run the job again after a failure.
    fn next_run_at(&self, _now: DateTime<Utc>, _attempt: &RetryAttempt) -> Option<DateTime<Utc>> {
        None
    }
}

/// A policy that defers everything to the configured defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {}

/// Configured fallbacks for [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryDefaults {
    pub(crate) max_attempts: i16,
    pub(crate) backoff: BackoffFn,
}

/// The single write that records a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJobUpdate {
    /// Job being updated
    pub job_id: i64,
    /// New attempt count
    pub attempts: i16,
    /// Next run time, or `None` once the job has failed permanently
    pub run_at: Option<DateTime<Utc>>,
    /// Set when the job has failed permanently
    pub failed_at: Option<DateTime<Utc>>,
    /// Formatted diagnostic
    pub last_error: String,
}

impl FailedJobUpdate {
    /// Whether the job will never be claimed again.
    pub fn is_terminal(&self) -> bool {
        self.run_at.is_none()
    }
}

/// Plan the outcome of a failed execution.
///
/// Pure apart from the inputs: the same job, policy, defaults and `now`
/// always produce the same update. Clearing the lock is implied by every
/// update.
pub fn plan_failure(
    job: &Job,
    policy: &dyn RetryPolicy,
    defaults: &RetryDefaults,
    now: DateTime<Utc>,
    last_error: String,
) -> Result<FailedJobUpdate, ValidationError> {
    let attempts = checked_attempts(i64::from(job.attempts) + 1)?;
    let max_attempts = policy.max_attempts().unwrap_or(defaults.max_attempts);

    let (run_at, failed_at) = if attempts >= max_attempts {
        (None, Some(now))
    } else {
        let attempt = RetryAttempt {
            attempts,
            max_attempts,
            run_at: job.run_at,
        };
        let next_run_at = policy
            .next_run_at(now, &attempt)
            .unwrap_or_else(|| (defaults.backoff)(now, &attempt));
        (Some(next_run_at), None)
    };

    Ok(FailedJobUpdate {
        job_id: job.id,
        attempts,
        run_at,
        failed_at,
        last_error,
    })
}
