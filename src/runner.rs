use crate::BackgroundJob;
use crate::config::Config;
use crate::job_registry::JobRegistry;
use crate::worker::{Worker, WorkerState};
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    job_registry: JobRegistry<Context>,
    context: Context,
    config: Arc<Config>,
    queues: QueueFilter,
    worker_name: String,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("context", &self.context)
            .field("config", &self.config)
            .field("queues", &self.queues)
            .field("worker_name", &self.worker_name)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool, context and configuration.
    pub fn new(connection_pool: PgPool, context: Context, config: Config) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            config: Arc::new(config),
            queues: QueueFilter::all(),
            worker_name: format!("worker-{}", std::process::id()),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Register a job type this runner can execute.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();

        Runner {
            connection_pool: self.connection_pool,
            job_registry: self.job_registry,
            context: self.context,
            config: self.config,
            queues: self.queues,
            worker_name: self.worker_name,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Only claim jobs from these queues.
    pub fn queues(mut self, queues: QueueFilter) -> Self {
        self.queues = queues;
        self
    }

    /// Name written to `locked_by` for every job this runner claims.
    pub fn worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the claim loop.
    ///
    /// This returns a `RunHandle` which can be used to request a shutdown and
    /// wait for running jobs to finish.
    pub fn start(&self) -> RunHandle {
        info!(worker.name = %self.worker_name, queues = ?self.queues, "Starting worker…");

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let (state, state_rx) = watch::channel(WorkerState::Idle);

        let worker = Worker {
            connection_pool: self.connection_pool.clone(),
            context: self.context.clone(),
            job_registry: Arc::new(self.job_registry.clone()),
            config: self.config.clone(),
            queues: self.queues.names().map(<[String]>::to_vec),
            worker_name: self.worker_name.clone(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            shutdown: shutdown.clone(),
            state,
        };

        let span = info_span!("worker", worker.name = %self.worker_name);
        let handle = tokio::spawn(async move { worker.run().instrument(span).await });

        RunHandle {
            handle,
            shutdown,
            state: state_rx,
        }
    }
}

/// Handle to a running claim loop
#[derive(Debug)]
pub struct RunHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<WorkerState>,
}

impl RunHandle {
    /// Stop claiming new jobs. Jobs already running are left to finish.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Current state of the claim loop.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait for the claim loop to exit and all running jobs to finish.
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(%error, "Background worker task panicked");
        }
    }

    /// Wait for SIGINT or SIGTERM, then shut down gracefully.
    pub async fn shutdown_on_signal(self) -> std::io::Result<()> {
        tokio::select! {
            result = termination_signal() => {
                result?;
                info!("Received shutdown signal. Exiting…");
                self.shutdown();
            }
            _ = wait_until_stopped(self.state.clone()) => {}
        }
        self.wait_for_shutdown().await;
        Ok(())
    }
}

async fn wait_until_stopped(mut state: watch::Receiver<WorkerState>) {
    let _ = state.wait_for(|state| *state == WorkerState::Stopped).await;
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Which queues a runner claims jobs from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    queues: Option<Vec<String>>,
}

impl QueueFilter {
    /// Claim from every queue, including the default one.
    pub fn all() -> Self {
        Self::default()
    }

    /// Claim only from the named queues. No names means every queue.
    pub fn only<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues: Vec<String> = queues
            .into_iter()
            .map(Into::into)
            .filter(|name| !name.is_empty())
            .collect();
        Self {
            queues: (!queues.is_empty()).then_some(queues),
        }
    }

    /// Parse a comma separated list such as `"mailers, reports"`.
    pub fn parse(list: &str) -> Self {
        Self::only(list.split(',').map(str::trim))
    }

    /// The selected queue names, or `None` for every queue.
    pub fn names(&self) -> Option<&[String]> {
        self.queues.as_deref()
    }
}
