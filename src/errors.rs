use std::time::Duration;

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job could not be serialized into a payload.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The job record violates one of the schema bounds.
    #[error(transparent)]
    InvalidJob(#[from] ValidationError),

    /// The database rejected the insert.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// A job record that would violate the schema invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The payload is `null`, an empty object or an empty string.
    #[error("job payload must not be empty")]
    EmptyPayload,

    /// The payload does not name a job type.
    #[error("job type must not be empty")]
    EmptyJobType,

    /// Priority outside of `[-32768, 32767]`.
    #[error("priority {0} is out of range")]
    PriorityOutOfRange(i64),

    /// Attempts outside of `[0, 32767]`.
    #[error("attempts {0} is out of range")]
    AttemptsOutOfRange(i64),
}

/// Why a claimed job did not complete successfully.
///
/// Every variant is routed through the retry policy; none of them ever
/// reach the claim loop.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    /// The job body returned an error.
    #[error(transparent)]
    Error(#[from] anyhow::Error),

    /// The job body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job did not finish within the maximum run timeout.
    #[error("job exceeded the maximum run time of {0:?}")]
    TimedOut(Duration),

    /// No job type with this name is registered with the runner.
    #[error("unknown job type {0}")]
    UnknownJobType(String),

    /// The stored payload could not be decoded.
    #[error("invalid job payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl JobFailure {
    /// Short name of the failure kind, used as the first word of the
    /// persisted diagnostic.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error(_) => "JobFailure::Error",
            Self::Panicked(_) => "JobFailure::Panicked",
            Self::TimedOut(_) => "JobFailure::TimedOut",
            Self::UnknownJobType(_) => "JobFailure::UnknownJobType",
            Self::InvalidPayload(_) => "JobFailure::InvalidPayload",
        }
    }
}
