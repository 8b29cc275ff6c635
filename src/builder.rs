use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::RngCore;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::info;

use crate::errors::LockerError;
use crate::job::{JobDescriptor, JobRunner, WorkerStartFn};
use crate::job_queue::JobQueue;
use crate::listener::Listener;
use crate::lock_registry::LockRegistry;
use crate::locker::{shutdown_signal, ControlLoop, LockConn, Locker, LockerState};
use crate::poller::Poller;
use crate::sql::registration;
use crate::worker::Worker;

pub const DEFAULT_WORKER_COUNT: usize = 6;
pub const DEFAULT_WORKER_PRIORITIES: [i16; 3] = [10, 30, 50];
pub const DEFAULT_MAXIMUM_QUEUE_SIZE: usize = 8;
pub const DEFAULT_MINIMUM_QUEUE_SIZE: usize = 2;
pub const DEFAULT_WAIT_PERIOD: Duration = Duration::from_millis(50);

/// Builder for a [`Locker`].
///
/// All keys are optional except a job runner and some way to reach the
/// database (a pool or a `database_url`). `start` resolves defaults,
/// registers the locker and spawns its tasks; it only returns once the
/// locker is running, and any earlier failure is surfaced to the caller.
#[derive(Default)]
pub struct LockerOptions {
    listen: Option<bool>,
    poll_interval: Option<Duration>,
    wait_period: Option<Duration>,
    minimum_queue_size: Option<usize>,
    maximum_queue_size: Option<usize>,
    worker_count: Option<usize>,
    worker_priorities: Option<Vec<Option<i16>>>,
    connection: Option<PgConnection>,
    pg_pool: Option<PgPool>,
    database_url: Option<String>,
    max_pg_conn: Option<u32>,
    job_runner: Option<JobRunner>,
    on_worker_start: Option<WorkerStartFn>,
    listen_os_shutdown_signals: bool,
}

/// Errors that can occur while building and starting a locker.
#[derive(Error, Debug)]
pub enum LockerBuildError {
    #[error("Error occured while connecting to the postgres database : {0}")]
    ConnectError(#[from] sqlx::Error),
    #[error("Error occured while querying : {0}")]
    QueryError(#[from] LockerError),
    #[error("Missing database_url config")]
    MissingDatabaseUrl,
    #[error("Missing job_runner config")]
    MissingJobRunner,
    #[error("worker_count must be greater than zero")]
    NoWorkers,
    #[error("maximum_queue_size must be greater than zero")]
    EmptyQueue,
    #[error("worker_priorities has {priorities} entries, more than the {workers} configured workers")]
    TooManyWorkerPriorities { priorities: usize, workers: usize },
    #[error("minimum_queue_size ({minimum}) must not exceed maximum_queue_size ({maximum})")]
    InvalidQueueSizes { minimum: usize, maximum: usize },
}

/// The configuration a locker actually runs with, after defaulting and
/// validation.
#[derive(Debug)]
struct ResolvedConfig {
    listen: bool,
    poll_interval: Option<Duration>,
    wait_period: Duration,
    minimum_queue_size: usize,
    maximum_queue_size: usize,
    worker_priorities: Vec<Option<i16>>,
}

impl LockerOptions {
    fn resolved(&self) -> Result<ResolvedConfig, LockerBuildError> {
        let maximum_queue_size = self
            .maximum_queue_size
            .unwrap_or(DEFAULT_MAXIMUM_QUEUE_SIZE);
        if maximum_queue_size == 0 {
            return Err(LockerBuildError::EmptyQueue);
        }

        let minimum_queue_size = self
            .minimum_queue_size
            .unwrap_or_else(|| DEFAULT_MINIMUM_QUEUE_SIZE.min(maximum_queue_size));
        if minimum_queue_size > maximum_queue_size {
            return Err(LockerBuildError::InvalidQueueSizes {
                minimum: minimum_queue_size,
                maximum: maximum_queue_size,
            });
        }

        let worker_count = self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
        if worker_count == 0 {
            return Err(LockerBuildError::NoWorkers);
        }

        // Positions beyond the configured ceilings default to unbounded, so
        // a short list dedicates the leading workers to urgent traffic.
        let mut worker_priorities = match &self.worker_priorities {
            Some(priorities) => {
                if priorities.len() > worker_count {
                    return Err(LockerBuildError::TooManyWorkerPriorities {
                        priorities: priorities.len(),
                        workers: worker_count,
                    });
                }
                priorities.clone()
            }
            None => {
                let mut priorities: Vec<Option<i16>> =
                    DEFAULT_WORKER_PRIORITIES.iter().copied().map(Some).collect();
                priorities.truncate(worker_count);
                priorities
            }
        };
        worker_priorities.resize(worker_count, None);

        Ok(ResolvedConfig {
            listen: self.listen.unwrap_or(true),
            poll_interval: self.poll_interval,
            wait_period: self.wait_period.unwrap_or(DEFAULT_WAIT_PERIOD),
            minimum_queue_size,
            maximum_queue_size,
            worker_priorities,
        })
    }

    /// Starts the locker: resolves configuration, establishes the lock
    /// connection, clears stale registrations, registers this locker,
    /// spawns workers, listener, poller and the control loop, and returns
    /// a running [`Locker`].
    pub async fn start(self) -> Result<Locker, LockerBuildError> {
        let config = self.resolved()?;
        let job_runner = self.job_runner.ok_or(LockerBuildError::MissingJobRunner)?;

        let pg_pool = match self.pg_pool {
            Some(pg_pool) => pg_pool,
            None => {
                let db_url = self
                    .database_url
                    .ok_or(LockerBuildError::MissingDatabaseUrl)?;

                PgPoolOptions::new()
                    .max_connections(self.max_pg_conn.unwrap_or(10))
                    .connect(&db_url)
                    .await?
            }
        };

        // The one session that owns every advisory lock this locker takes.
        let mut lock_conn = match self.connection {
            Some(connection) => connection,
            None => pg_pool.acquire().await?.detach(),
        };

        let backend_pid = registration::backend_pid(&mut lock_conn).await?;

        let channel = format!("locker_{backend_pid}");
        let pg_listener = if config.listen {
            let mut pg_listener = PgListener::connect_with(&pg_pool).await?;
            pg_listener.listen(&channel).await?;
            Some(pg_listener)
        } else {
            None
        };

        registration::clean_stale_lockers(&mut lock_conn).await?;

        let mut random_bytes = [0u8; 9];
        rand::rng().fill_bytes(&mut random_bytes);
        let locker_id = format!("locker_{}", hex::encode(random_bytes));

        registration::register_locker(
            &mut lock_conn,
            std::process::id() as i32,
            &hostname(),
            config.worker_priorities.len() as i16,
            config.listen,
        )
        .await?;

        let job_queue = Arc::new(JobQueue::new(config.maximum_queue_size));
        let registry = Arc::new(LockRegistry::new());
        let lock_conn: LockConn = Arc::new(Mutex::new(lock_conn));
        let stop_notify = Arc::new(Notify::new());
        let shutdown = shutdown_signal(stop_notify.clone());
        let poller_wake = Arc::new(Notify::new());
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(config.worker_priorities.len());
        let mut worker_handles = Vec::with_capacity(config.worker_priorities.len());
        for (index, priority_ceiling) in config.worker_priorities.iter().enumerate() {
            let (info, handle) = Worker {
                index,
                priority_ceiling: *priority_ceiling,
                job_queue: job_queue.clone(),
                results: result_tx.clone(),
                job_runner: job_runner.clone(),
                on_start: self.on_worker_start.clone(),
            }
            .spawn();
            workers.push(info);
            worker_handles.push(handle);
        }
        // Workers hold the only senders, so the control loop can tell when
        // the last one has exited.
        drop(result_tx);

        let listener_handle = pg_listener.map(|pg_listener| {
            tokio::spawn(
                Listener {
                    pg_listener,
                    channel: channel.clone(),
                    job_queue: job_queue.clone(),
                    registry: registry.clone(),
                    lock_conn: lock_conn.clone(),
                    shutdown: shutdown.clone(),
                }
                .run(),
            )
        });

        let poller_handle = tokio::spawn(
            Poller {
                job_queue: job_queue.clone(),
                registry: registry.clone(),
                lock_conn: lock_conn.clone(),
                poll_interval: config.poll_interval,
                wake: poller_wake.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        let (state_tx, state_rx) = watch::channel(LockerState::Running);

        info!(
            event = "locker_start",
            locker_id = %locker_id,
            listen = config.listen,
            backend_pid,
            poll_interval = ?config.poll_interval,
            wait_period = ?config.wait_period,
            minimum_queue_size = config.minimum_queue_size,
            maximum_queue_size = config.maximum_queue_size,
            worker_priorities = ?config.worker_priorities,
            "Locker running"
        );

        let control_handle = tokio::spawn(
            ControlLoop {
                job_queue: job_queue.clone(),
                registry: registry.clone(),
                lock_conn,
                result_rx,
                shutdown,
                poller_wake,
                wait_period: config.wait_period,
                minimum_queue_size: config.minimum_queue_size,
                worker_handles,
                listener_handle,
                poller_handle: Some(poller_handle),
                state_tx,
            }
            .run(),
        );

        if self.listen_os_shutdown_signals {
            let stop_notify = stop_notify.clone();
            tokio::spawn(async move {
                crate::signals::os_shutdown_signal().await;
                info!("Shutdown signal detected. Attempting graceful shutdown...");
                stop_notify.notify_one();
            });
        }

        Ok(Locker {
            locker_id,
            backend_pid,
            listen: config.listen,
            poll_interval: config.poll_interval,
            wait_period: config.wait_period,
            minimum_queue_size: config.minimum_queue_size,
            maximum_queue_size: config.maximum_queue_size,
            worker_priorities: config.worker_priorities,
            workers,
            job_queue,
            registry,
            stop_notify,
            state_rx,
            control_handle: Mutex::new(Some(control_handle)),
        })
    }

    /// Enables or disables the notification-driven path. Defaults to true;
    /// when disabled the locker runs poll-only.
    pub fn listen(mut self, value: bool) -> Self {
        self.listen = Some(value);
        self
    }

    /// Interval between periodic batch polls. When unset, periodic polling
    /// is disabled and only startup and demand polls run.
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    /// Idle tick granularity of the control loop.
    pub fn wait_period(mut self, value: Duration) -> Self {
        self.wait_period = Some(value);
        self
    }

    /// Queue low-water mark: a completion that leaves the queue at or
    /// below this size triggers a demand poll.
    pub fn minimum_queue_size(mut self, value: usize) -> Self {
        self.minimum_queue_size = Some(value);
        self
    }

    /// Hard cap on the job queue; pushes beyond it spill the least urgent
    /// descriptors.
    pub fn maximum_queue_size(mut self, value: usize) -> Self {
        self.maximum_queue_size = Some(value);
        self
    }

    pub fn worker_count(mut self, value: usize) -> Self {
        self.worker_count = Some(value);
        self
    }

    /// Ordered priority ceilings for the leading workers; positions beyond
    /// the list default to unbounded (`None`).
    pub fn worker_priorities(mut self, value: Vec<Option<i16>>) -> Self {
        self.worker_priorities = Some(value);
        self
    }

    /// Uses `value` as the lock connection instead of detaching one from
    /// the pool.
    pub fn connection(mut self, value: PgConnection) -> Self {
        self.connection = Some(value);
        self
    }

    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    pub fn max_pg_conn(mut self, value: u32) -> Self {
        self.max_pg_conn = Some(value);
        self
    }

    /// The job invocation callback. It receives the descriptor of a job
    /// whose advisory lock this process holds and performs all database
    /// work itself; an `Err` is logged by the worker and goes no further.
    pub fn job_runner<F, Fut, E>(mut self, runner: F) -> Self
    where
        F: Fn(JobDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Debug,
    {
        let runner = Arc::new(runner);
        self.job_runner = Some(Arc::new(move |descriptor: JobDescriptor| {
            let runner = runner.clone();
            async move { runner(descriptor).await.map_err(|e| format!("{e:?}")) }.boxed()
        }));
        self
    }

    /// Callback invoked once per worker, with the worker's index, from that
    /// worker's own task before it starts popping jobs.
    pub fn on_worker_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_worker_start = Some(Arc::new(callback));
        self
    }

    /// When enabled, SIGINT/SIGTERM request a graceful stop. Off by
    /// default so embedders keep ownership of signal handling.
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = value;
        self
    }
}

/// Best-effort hostname for the registration row.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}
