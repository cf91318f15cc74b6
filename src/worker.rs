use crate::config::Config;
use crate::error_report::format_failure;
use crate::errors::JobFailure;
use crate::job_registry::JobRegistry;
use crate::retry::plan_failure;
use crate::schema::{Job, JobPayload};
use crate::storage::{self, Claim, HeldLock, LockStatus};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Where the claim loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Sleeping because nothing was due or the task limit was reached.
    Idle,
    /// Waiting for the database to hand out the next job.
    Claiming,
    /// Jobs are running and the loop keeps polling.
    Executing(usize),
    /// Shutdown was requested; waiting for running jobs to finish.
    Draining(usize),
    /// The loop has exited and every job has finished.
    Stopped,
}

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) config: Arc<Config>,
    pub(crate) queues: Option<Vec<String>>,
    pub(crate) worker_name: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) shutdown: Arc<watch::Sender<bool>>,
    pub(crate) state: watch::Sender<WorkerState>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let poll_interval = self.config.idle_sleep();
        let jitter = self.config.idle_jitter();
        if jitter.is_zero() {
            return poll_interval;
        }

        let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and dispatch jobs until shutdown is requested, or until the
    /// queue is empty if `shutdown_when_queue_empty` is set, then wait for
    /// every dispatched job to finish.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            if *shutdown.borrow() {
                info!("Shutdown requested, no longer claiming jobs…");
                break;
            }

            if let Some(limit) = self.config.limit().filter(|limit| tasks.len() >= *limit) {
                let sleep_duration = self.config.limit_sleep();
                debug!("Task limit {limit} reached. Polling again in {sleep_duration:?}…");
                self.state.send_replace(WorkerState::Idle);
                self.wait(sleep_duration, &mut tasks, &mut shutdown).await;
                continue;
            }

            self.state.send_replace(WorkerState::Claiming);
            trace!("Looking for next background worker job…");
            let claimed_at = Instant::now();
            match self.claim_next_job().await {
                Ok(Some(job)) => {
                    self.dispatch(&mut tasks, job, claimed_at);
                    self.state.send_replace(WorkerState::Executing(tasks.len()));
                    tokio::task::yield_now().await;
                }
                Ok(None) if self.shutdown_when_queue_empty && tasks.is_empty() => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        "No pending background worker jobs found. Polling again in {sleep_duration:?}…",
                    );
                    self.state.send_replace(idle_or_executing(tasks.len()));
                    self.wait(sleep_duration, &mut tasks, &mut shutdown).await;
                }
                Err(error) => {
                    error!("Failed to claim job: {error}");
                    self.state.send_replace(idle_or_executing(tasks.len()));
                    self.wait(self.sleep_duration_with_jitter(), &mut tasks, &mut shutdown)
                        .await;
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for running jobs to finish…");
        }
        while !tasks.is_empty() {
            self.state.send_replace(WorkerState::Draining(tasks.len()));
            if let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        info!("Worker stopped");
    }

    async fn claim_next_job(&self) -> Result<Option<Job>, sqlx::Error> {
        let claim = Claim {
            now: Utc::now(),
            worker_name: &self.worker_name,
            queues: self.queues.as_deref(),
            stale_after: self.config.run_timeout(),
        };
        storage::claim_next_job(&self.connection_pool, &claim).await
    }

    /// Sleep for `duration`, waking early on shutdown or when a running job
    /// finishes.
    async fn wait(
        &self,
        duration: Duration,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        tokio::select! {
            () = sleep(duration) => {}
            _ = shutdown.changed() => {}
            Some(result) = tasks.join_next() => log_task_result(result),
        }
    }

    /// Start executing `job` without waiting for it.
    ///
    /// `claimed_at` is taken before the claim's `now`, so the execution
    /// deadline never falls after the moment the lock becomes stale.
    fn dispatch(&self, tasks: &mut JoinSet<()>, job: Job, claimed_at: Instant) {
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = job.job_type().unwrap_or("<unknown>"),
        );

        let execution = Execution {
            connection_pool: self.connection_pool.clone(),
            job_registry: self.job_registry.clone(),
            config: self.config.clone(),
            claimed_at,
        };
        let context = self.context.clone();

        tasks.spawn(async move { execution.run(context, job).await }.instrument(span));
    }
}

fn idle_or_executing(in_flight: usize) -> WorkerState {
    match in_flight {
        0 => WorkerState::Idle,
        n => WorkerState::Executing(n),
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(error) = result {
        warn!(%error, "Background job task panicked");
    }
}

/// Everything a dispatched job needs once it has left the claim loop.
struct Execution<Context> {
    connection_pool: PgPool,
    job_registry: Arc<JobRegistry<Context>>,
    config: Arc<Config>,
    claimed_at: Instant,
}

impl<Context: Clone + Send + Sync + 'static> Execution<Context> {
    async fn run(self, context: Context, job: Job) {
        let Some(lock) = HeldLock::of(&job) else {
            error!("Claimed job carries no lock, leaving it untouched");
            return;
        };

        debug!("Performing job…");
        let started = Instant::now();
        let result = self.perform(context, &job).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                debug!(elapsed_ms, "Job performed. Deleting successful job…");
                match storage::delete_successful_job(&self.connection_pool, &lock).await {
                    Ok(LockStatus::Held) => {}
                    Ok(LockStatus::Lost) => {
                        warn!("Lock lost before the successful job was deleted");
                    }
                    Err(error) => error!("Failed to delete successful job: {error}"),
                }
            }
            Err(failure) => {
                warn!(elapsed_ms, "Failed to run job: {failure}");
                match self.record_failure(&job, &lock, &failure).await {
                    Ok(LockStatus::Held) => {}
                    Ok(LockStatus::Lost) => {
                        warn!("Lock lost before the job failure was recorded");
                    }
                    Err(error) => error!(
                        "Failed to record job failure; the job stays locked until its lock goes stale: {error}"
                    ),
                }
            }
        }
    }

    async fn perform(&self, context: Context, job: &Job) -> Result<(), JobFailure> {
        let JobPayload {
            job_type,
            arguments,
        } = serde_json::from_value(job.payload.clone()).map_err(JobFailure::InvalidPayload)?;

        let entry = self
            .job_registry
            .get(&job_type)
            .ok_or_else(|| JobFailure::UnknownJobType(job_type.clone()))?;
        let deadline = self
            .config
            .run_timeout()
            .map(|limit| (self.claimed_at + limit, limit));

        with_sentry_transaction(&job_type, || async move {
            let run = AssertUnwindSafe((entry.run)(context, arguments)).catch_unwind();
            let outcome = match deadline {
                Some((deadline, limit)) => tokio::time::timeout_at(deadline, run)
                    .await
                    .map_err(|_| JobFailure::TimedOut(limit))?,
                None => run.await,
            };

            outcome
                .map_err(|panic| try_to_extract_panic_info(&*panic))?
                .map_err(JobFailure::from)
        })
        .await
    }

    async fn record_failure(
        &self,
        job: &Job,
        lock: &HeldLock<'_>,
        failure: &JobFailure,
    ) -> anyhow::Result<LockStatus> {
        let policy = self.job_registry.retry_policy(job.job_type());
        let update = plan_failure(
            job,
            policy.as_ref(),
            &self.config.retry_defaults(),
            Utc::now(),
            format_failure(failure),
        )?;

        match update.run_at {
            Some(run_at) => debug!(attempts = update.attempts, %run_at, "Rescheduling failed job…"),
            None => warn!(attempts = update.attempts, "Job failed permanently"),
        }

        Ok(storage::update_failed_job(&self.connection_pool, lock, &update).await?)
    }
}
