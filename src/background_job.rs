use crate::config::Config;
use crate::errors::{EnqueueError, ValidationError};
use crate::retry::RetryAttempt;
use crate::schema::{Job, JobPayload, NewJob, checked_priority};
use crate::storage;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Default priority of the task. Lower values run first.
    ///
    /// `None` uses the configured default priority.
    const PRIORITY: Option<i16> = None;

    /// Job queue where this job will be executed.
    ///
    /// `None` uses the configured default queue.
    const QUEUE: Option<&'static str> = None;

    /// Attempts allowed before the job fails permanently.
    ///
    /// `None` uses the configured default.
    const MAX_ATTEMPTS: Option<i16> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// When to run the job again after a failed attempt.
    ///
    /// `None` uses the configured default backoff.
    fn next_run_at(_now: DateTime<Utc>, _attempt: &RetryAttempt) -> Option<DateTime<Utc>> {
        None
    }

    /// Enqueue this job for immediate background execution.
    ///
    /// Only the job type's own `PRIORITY` and `QUEUE` apply here; a [`Config`]
    /// is never consulted. Pass [`EnqueueOptions::from_config`] to
    /// [`enqueue_with`](Self::enqueue_with) to fall back to the configured
    /// default priority and queue.
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Job, EnqueueError>> {
        self.enqueue_with(pool, EnqueueOptions::default())
    }

    /// Enqueue this job with explicit scheduling options.
    #[instrument(name = "pgjobs.enqueue", skip(self, pool, options), fields(message = Self::JOB_TYPE))]
    fn enqueue_with<'a>(
        &'a self,
        pool: &'a PgPool,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<Job, EnqueueError>> {
        let arguments = match serde_json::to_value(self) {
            Ok(arguments) => arguments,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };
        let payload = JobPayload {
            job_type: Self::JOB_TYPE.to_string(),
            arguments,
        };
        let new_job = match serde_json::to_value(payload) {
            Ok(payload) => options.into_new_job::<Self>(payload),
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        async move { storage::insert_job(pool, &new_job).await }.boxed()
    }
}

/// Scheduling options for a single enqueue.
///
/// Values set here win over the job type's constants, which win over the
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    priority: Option<i16>,
    queue_name: Option<String>,
    run_at: Option<DateTime<Utc>>,
    default_priority: i16,
    default_queue_name: Option<String>,
}

impl EnqueueOptions {
    /// Options that fall back to the configured default priority and queue.
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_priority: config.priority(),
            default_queue_name: config.queue_name().map(str::to_string),
            ..Self::default()
        }
    }

    /// Run with this priority.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Run with a priority given as a wider integer, such as one read from
    /// user input. Fails if it does not fit the priority column.
    pub fn try_priority(self, priority: i64) -> Result<Self, ValidationError> {
        Ok(self.priority(checked_priority(priority)?))
    }

    /// Run on this queue. An empty name means the default queue.
    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Do not run before `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Do not run before `delay` has elapsed.
    pub fn delay(self, delay: Duration) -> Self {
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.run_at(run_at)
    }

    pub(crate) fn into_new_job<J: BackgroundJob>(self, payload: serde_json::Value) -> NewJob {
        let priority = self
            .priority
            .or(J::PRIORITY)
            .unwrap_or(self.default_priority);
        let queue_name = self
            .queue_name
            .or_else(|| J::QUEUE.map(str::to_string))
            .or(self.default_queue_name)
            .filter(|name| !name.is_empty());

        NewJob {
            payload,
            queue_name,
            priority,
            run_at: self.run_at.unwrap_or_else(Utc::now),
        }
    }
}
