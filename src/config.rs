use crate::retry::{BackoffFn, RetryAttempt, RetryDefaults};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: i16 = 25;
const DEFAULT_MAX_RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_NO_JOB_SLEEP: Duration = Duration::from_secs(3);
const DEFAULT_TASK_LIMIT_SLEEP: Duration = Duration::from_secs(3);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Tunables shared by the enqueue path and the runner.
///
/// Build one at startup and hand it to [`Runner::new`](crate::Runner::new) and
/// [`EnqueueOptions::from_config`](crate::EnqueueOptions::from_config).
#[derive(Clone)]
pub struct Config {
    default_max_attempts: i16,
    default_backoff: BackoffFn,
    default_priority: i16,
    default_queue_name: Option<String>,
    max_run_timeout: Option<Duration>,
    no_job_sleep_duration: Duration,
    jitter: Duration,
    task_limit: Option<usize>,
    task_limit_sleep_duration: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("default_max_attempts", &self.default_max_attempts)
            .field("default_backoff", &"<function>")
            .field("default_priority", &self.default_priority)
            .field("default_queue_name", &self.default_queue_name)
            .field("max_run_timeout", &self.max_run_timeout)
            .field("no_job_sleep_duration", &self.no_job_sleep_duration)
            .field("jitter", &self.jitter)
            .field("task_limit", &self.task_limit)
            .field("task_limit_sleep_duration", &self.task_limit_sleep_duration)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_backoff: Arc::new(linear_backoff),
            default_priority: 0,
            default_queue_name: None,
            max_run_timeout: Some(DEFAULT_MAX_RUN_TIMEOUT),
            no_job_sleep_duration: DEFAULT_NO_JOB_SLEEP,
            jitter: DEFAULT_JITTER,
            task_limit: None,
            task_limit_sleep_duration: DEFAULT_TASK_LIMIT_SLEEP,
        }
    }
}

/// Retry `attempts` minutes from now.
pub fn linear_backoff(now: DateTime<Utc>, attempt: &RetryAttempt) -> DateTime<Utc> {
    now + TimeDelta::minutes(i64::from(attempt.attempts))
}

impl Config {
    /// Attempts allowed for job types that do not set their own limit.
    pub fn default_max_attempts(mut self, max_attempts: i16) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Backoff used for job types that do not provide `next_run_at`.
    pub fn default_backoff(
        mut self,
        backoff: impl Fn(DateTime<Utc>, &RetryAttempt) -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.default_backoff = Arc::new(backoff);
        self
    }

    /// Priority given to jobs enqueued without one.
    pub fn default_priority(mut self, priority: i16) -> Self {
        self.default_priority = priority;
        self
    }

    /// Queue given to jobs enqueued without one.
    pub fn default_queue_name(mut self, queue_name: Option<String>) -> Self {
        self.default_queue_name = queue_name.filter(|name| !name.is_empty());
        self
    }

    /// Bound on a single execution.
    ///
    /// Jobs running longer are cancelled and retried, and locks older than
    /// this are considered abandoned. `None` disables both.
    pub fn max_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.max_run_timeout = timeout;
        self
    }

    /// How long to wait before polling again when no job is due.
    pub fn no_job_sleep_duration(mut self, duration: Duration) -> Self {
        self.no_job_sleep_duration = duration;
        self
    }

    /// Set the maximum random jitter to add to idle sleeps.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Maximum number of jobs executing at once in one runner.
    pub fn task_limit(mut self, limit: Option<usize>) -> Self {
        self.task_limit = limit;
        self
    }

    /// How long to wait before polling again when the task limit is reached.
    pub fn task_limit_sleep_duration(mut self, duration: Duration) -> Self {
        self.task_limit_sleep_duration = duration;
        self
    }

    pub(crate) fn retry_defaults(&self) -> RetryDefaults {
        RetryDefaults {
            max_attempts: self.default_max_attempts,
            backoff: self.default_backoff.clone(),
        }
    }

    pub(crate) fn priority(&self) -> i16 {
        self.default_priority
    }

    pub(crate) fn queue_name(&self) -> Option<&str> {
        self.default_queue_name.as_deref()
    }

    pub(crate) fn run_timeout(&self) -> Option<Duration> {
        self.max_run_timeout
    }

    pub(crate) fn idle_sleep(&self) -> Duration {
        self.no_job_sleep_duration
    }

    pub(crate) fn idle_jitter(&self) -> Duration {
        self.jitter
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.task_limit
    }

    pub(crate) fn limit_sleep(&self) -> Duration {
        self.task_limit_sleep_duration
    }
}
