#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod config;
mod error_report;
mod errors;
mod job_registry;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, EnqueueOptions};
/// Tunables for the runner and the enqueue path.
pub use self::config::{Config, linear_backoff};
/// Rendering of failures into persisted diagnostics.
pub use self::error_report::{format_error, format_failure};
/// Error types for enqueueing and executing jobs.
pub use self::errors::{EnqueueError, JobFailure, ValidationError};
/// Retry decisions after a failed execution.
pub use self::retry::{
    BackoffFn, DefaultRetryPolicy, FailedJobUpdate, RetryAttempt, RetryDefaults, RetryPolicy,
    plan_failure,
};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, QueueFilter, RunHandle, Runner, Unconfigured};
/// Direct access to the job table.
pub use self::storage::{
    Claim, claim_next_job, failed_job_count, find_job, get_failed_jobs, insert_job, setup_database,
};
/// State of a running claim loop.
pub use self::worker::WorkerState;
