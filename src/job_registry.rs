use crate::BackgroundJob;
use crate::retry::{DefaultRetryPolicy, RetryAttempt, RetryPolicy};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

pub(crate) struct RegisteredJob<Context> {
    pub(crate) run: Arc<RunTaskFn<Context>>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            retry_policy: self.retry_policy.clone(),
        }
    }
}

pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RegisteredJob<Context>>,
    fallback_policy: Arc<dyn RetryPolicy>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            fallback_policy: Arc::new(DefaultRetryPolicy),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            fallback_policy: self.fallback_policy.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: Arc<RunTaskFn<Context>> = Arc::new(|context: Context, arguments: Value| {
            async move {
                let job: J = serde_json::from_value(arguments)
                    .with_context(|| format!("failed to deserialize {} arguments", J::JOB_TYPE))?;
                job.run(context).await
            }
            .boxed()
        });

        self.entries.insert(
            J::JOB_TYPE.to_string(),
            RegisteredJob {
                run,
                retry_policy: Arc::new(JobRetryPolicy::<J>(PhantomData)),
            },
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.entries.get(job_type)
    }

    /// The retry policy for `job_type`, or the defaults-only policy when the
    /// type is not registered.
    pub(crate) fn retry_policy(&self, job_type: Option<&str>) -> Arc<dyn RetryPolicy> {
        job_type
            .and_then(|job_type| self.entries.get(job_type))
            .map_or_else(
                || self.fallback_policy.clone(),
                |entry| entry.retry_policy.clone(),
            )
    }
}

/// Exposes a job type's retry overrides as a [`RetryPolicy`].
struct JobRetryPolicy<J>(PhantomData<fn() -> J>);

impl<J: BackgroundJob> RetryPolicy for JobRetryPolicy<J> {
    fn max_attempts(&self) -> Option<i16> {
        J::MAX_ATTEMPTS
    }

    fn next_run_at(&self, now: DateTime<Utc>, attempt: &RetryAttempt) -> Option<DateTime<Utc>> {
        J::next_run_at(now, attempt)
    }
}
