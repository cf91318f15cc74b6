//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the background job system.

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Smallest allowed priority (most urgent).
pub const PRIORITY_MIN: i16 = i16::MIN;
/// Largest allowed priority (least urgent).
pub const PRIORITY_MAX: i16 = i16::MAX;
/// Smallest allowed attempt counter.
pub const ATTEMPTS_MIN: i16 = 0;
/// Largest allowed attempt counter.
pub const ATTEMPTS_MAX: i16 = i16::MAX;

/// Represents a background job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// JSON payload, see [`JobPayload`]
    pub payload: Value,
    /// Logical queue the job belongs to; `None` is the default queue
    pub queue_name: Option<String>,
    /// Priority of the job (lower = more urgent)
    pub priority: i16,
    /// Earliest time the job may run; `None` once it has failed permanently
    pub run_at: Option<DateTime<Utc>>,
    /// Number of execution attempts that have finished so far
    pub attempts: i16,
    /// When a worker claimed the job
    pub locked_at: Option<DateTime<Utc>>,
    /// Name of the worker holding the lock
    pub locked_by: Option<String>,
    /// Formatted diagnostic of the most recent failure
    pub last_error: Option<String>,
    /// When the job exhausted its retry budget
    pub failed_at: Option<DateTime<Utc>>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// The job type stored in the payload, if the payload is well-formed.
    pub fn job_type(&self) -> Option<&str> {
        self.payload.get("job_type").and_then(Value::as_str)
    }

    /// Whether the job has failed permanently and will never be claimed again.
    pub fn is_failed(&self) -> bool {
        self.run_at.is_none()
    }
}

/// The serialized unit of work stored in [`Job::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Name the job type was registered under.
    pub job_type: String,
    /// The serialized job struct.
    pub arguments: Value,
}

/// A job record that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// JSON payload
    pub payload: Value,
    /// Target queue
    pub queue_name: Option<String>,
    /// Priority (lower = more urgent)
    pub priority: i16,
    /// Earliest run time
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    /// Build a record for the given payload, due now, at default priority.
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            queue_name: None,
            priority: 0,
            run_at: Utc::now(),
        }
    }

    /// Check the payload before it is written.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_empty_payload(&self.payload) {
            return Err(ValidationError::EmptyPayload);
        }
        if let Some(job_type) = self.payload.get("job_type") {
            if job_type.as_str().is_none_or(str::is_empty) {
                return Err(ValidationError::EmptyJobType);
            }
        }
        Ok(())
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Narrow a priority to its column type, rejecting out-of-range values.
pub fn checked_priority(priority: i64) -> Result<i16, ValidationError> {
    i16::try_from(priority).map_err(|_| ValidationError::PriorityOutOfRange(priority))
}

/// Narrow an attempt count to its column type, rejecting out-of-range values.
pub fn checked_attempts(attempts: i64) -> Result<i16, ValidationError> {
    match i16::try_from(attempts) {
        Ok(attempts) if attempts >= ATTEMPTS_MIN => Ok(attempts),
        _ => Err(ValidationError::AttemptsOutOfRange(attempts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_payloads_are_rejected() {
        for payload in [json!(null), json!({}), json!(""), json!([])] {
            let job = NewJob::new(payload);
            assert_eq!(job.validate(), Err(ValidationError::EmptyPayload));
        }
    }

    #[test]
    fn blank_job_type_is_rejected() {
        let job = NewJob::new(json!({ "job_type": "", "arguments": null }));
        assert_eq!(job.validate(), Err(ValidationError::EmptyJobType));

        let job = NewJob::new(json!({ "job_type": 5, "arguments": null }));
        assert_eq!(job.validate(), Err(ValidationError::EmptyJobType));
    }

    #[test]
    fn well_formed_payload_passes() {
        let job = NewJob::new(json!({ "job_type": "email", "arguments": { "to": "a@b.c" } }));
        assert_eq!(job.validate(), Ok(()));
    }

    #[test]
    fn priority_bounds() {
        assert_eq!(checked_priority(-32_768), Ok(PRIORITY_MIN));
        assert_eq!(checked_priority(32_767), Ok(PRIORITY_MAX));
        assert_eq!(
            checked_priority(32_768),
            Err(ValidationError::PriorityOutOfRange(32_768))
        );
        assert_eq!(
            checked_priority(-32_769),
            Err(ValidationError::PriorityOutOfRange(-32_769))
        );
    }

    #[test]
    fn attempts_bounds() {
        assert_eq!(checked_attempts(0), Ok(0));
        assert_eq!(checked_attempts(32_767), Ok(ATTEMPTS_MAX));
        assert_eq!(
            checked_attempts(-1),
            Err(ValidationError::AttemptsOutOfRange(-1))
        );
        assert_eq!(
            checked_attempts(32_768),
            Err(ValidationError::AttemptsOutOfRange(32_768))
        );
    }

    #[test]
    fn job_type_is_read_from_payload() {
        let job = Job {
            id: 1,
            payload: json!({ "job_type": "email", "arguments": {} }),
            queue_name: None,
            priority: 0,
            run_at: Some(Utc::now()),
            attempts: 0,
            locked_at: None,
            locked_by: None,
            last_error: None,
            failed_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(job.job_type(), Some("email"));
        assert!(!job.is_failed());
    }
}
