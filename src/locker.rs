use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::Shared;
use futures::FutureExt;
use getset::Getters;
use sqlx::PgConnection;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::LockerOptions;
use crate::job::JobDescriptor;
use crate::job_queue::JobQueue;
use crate::lock_registry::LockRegistry;
use crate::sql::advisory_lock::advisory_unlock;
use crate::sql::registration::deregister_locker;
use crate::worker::WorkerInfo;

/// The dedicated connection owning every advisory lock this locker
/// acquires, on both the poll and the notification path. Locks are
/// session-bound, so acquiring and releasing on one session sidesteps
/// chasing the connection that originally took a lock.
pub(crate) type LockConn = Arc<Mutex<PgConnection>>;

/// Future that completes once a stop has been requested. Cloneable so the
/// listener, the poller and the control loop can each select on it.
pub(crate) type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

pub(crate) fn shutdown_signal(notify: Arc<Notify>) -> ShutdownSignal {
    async move { notify.notified().await }.boxed().shared()
}

/// Lifecycle states of a [`Locker`].
///
/// A locker is handed out already `Running`; `Draining` covers the window
/// between a stop request and the last worker finishing its in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// A running job locker.
///
/// The locker discovers ready jobs through notifications and batch polls,
/// claims them with session-level advisory locks, queues them for its
/// worker pool and releases every claim on shutdown. Constructed through
/// [`Locker::options`]; dropping the handle does not stop the background
/// tasks, call [`stop`](Self::stop) or [`stop_and_wait`](Self::stop_and_wait).
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Locker {
    /// Random identity of this locker instance, used in log context
    pub(crate) locker_id: String,
    /// Backend pid of the lock connection; also names the notification
    /// channel `locker_<pid>` and keys the registration row
    pub(crate) backend_pid: i32,
    /// Whether the notification path is active
    pub(crate) listen: bool,
    /// Periodic poll timer, `None` when only demand polls run
    pub(crate) poll_interval: Option<Duration>,
    /// Idle tick granularity of the control loop
    pub(crate) wait_period: Duration,
    /// Queue low-water mark that triggers a demand poll
    pub(crate) minimum_queue_size: usize,
    /// Hard cap on the job queue
    pub(crate) maximum_queue_size: usize,
    /// Resolved priority ceilings, one per worker
    pub(crate) worker_priorities: Vec<Option<i16>>,
    /// One entry per spawned worker
    pub(crate) workers: Vec<WorkerInfo>,
    #[getset(skip)]
    pub(crate) job_queue: Arc<JobQueue>,
    #[getset(skip)]
    pub(crate) registry: Arc<LockRegistry>,
    #[getset(skip)]
    pub(crate) stop_notify: Arc<Notify>,
    #[getset(skip)]
    pub(crate) state_rx: watch::Receiver<LockerState>,
    #[getset(skip)]
    pub(crate) control_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Locker {
    /// Creates a new `LockerOptions` builder with default settings.
    pub fn options() -> LockerOptions {
        LockerOptions::default()
    }

    pub fn state(&self) -> LockerState {
        *self.state_rx.borrow()
    }

    /// The bounded priority queue feeding the worker pool.
    pub fn job_queue(&self) -> &Arc<JobQueue> {
        &self.job_queue
    }

    /// Job ids whose advisory locks this process currently holds.
    pub fn held_locks(&self) -> Vec<i64> {
        self.registry.snapshot()
    }

    /// Requests a graceful stop and returns immediately. Idempotent; the
    /// in-flight jobs run to completion, nothing is interrupted.
    pub fn stop(&self) {
        self.stop_notify.notify_one();
    }

    /// Requests a graceful stop and waits until the locker has fully
    /// stopped: workers joined, locks released, registration row deleted.
    pub async fn stop_and_wait(&self) {
        self.stop();
        self.wait_for_stop().await;
    }

    /// Waits for the locker to stop without requesting it.
    pub async fn wait_for_stop(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow() == LockerState::Stopped {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }

        if let Some(handle) = self.control_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "Locker control loop panicked");
            }
        }
    }
}

/// Releases the advisory lock for `job_id`, tolerating failure: any lock
/// this session failed to drop disappears with the session anyway, and a
/// lock held by some other backend was never ours to release.
pub(crate) async fn release_job_lock(lock_conn: &LockConn, job_id: i64) {
    let mut conn = lock_conn.lock().await;
    match advisory_unlock(&mut conn, job_id).await {
        Ok(true) => {}
        Ok(false) => warn!(job_id, "Advisory lock was not held at release"),
        Err(e) => warn!(job_id, error = %e, "Failed to release advisory lock"),
    }
}

/// Releases locks and registry entries for descriptors evicted from the
/// queue, done before the producing call site reports success.
pub(crate) async fn release_descriptors(
    lock_conn: &LockConn,
    registry: &LockRegistry,
    descriptors: &[JobDescriptor],
) {
    for descriptor in descriptors {
        let job_id = *descriptor.job_id();
        release_job_lock(lock_conn, job_id).await;
        registry.remove(job_id);
    }
}

/// The coordinator loop: consumes completions, releases their locks and
/// wakes the poller when the queue drains below its low-water mark. On a
/// stop request it owns the entire drain sequence.
pub(crate) struct ControlLoop {
    pub(crate) job_queue: Arc<JobQueue>,
    pub(crate) registry: Arc<LockRegistry>,
    pub(crate) lock_conn: LockConn,
    pub(crate) result_rx: mpsc::UnboundedReceiver<i64>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) poller_wake: Arc<Notify>,
    pub(crate) wait_period: Duration,
    pub(crate) minimum_queue_size: usize,
    pub(crate) worker_handles: Vec<JoinHandle<()>>,
    pub(crate) listener_handle: Option<JoinHandle<()>>,
    pub(crate) poller_handle: Option<JoinHandle<()>>,
    pub(crate) state_tx: watch::Sender<LockerState>,
}

impl ControlLoop {
    pub(crate) async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                completed = self.result_rx.recv() => {
                    let Some(job_id) = completed else { break };
                    self.finish_job(job_id).await;
                    if self.job_queue.size() <= self.minimum_queue_size {
                        self.poller_wake.notify_one();
                    }
                }
                _ = tokio::time::sleep(self.wait_period) => {}
            }
        }

        self.drain().await;
    }

    async fn finish_job(&self, job_id: i64) {
        release_job_lock(&self.lock_conn, job_id).await;
        self.registry.remove(job_id);
    }

    /// Unsubscribe, stop the queue, join the workers, release whatever is
    /// left and deregister, strictly in that order.
    async fn drain(mut self) {
        let _ = self.state_tx.send(LockerState::Draining);
        debug!("Locker draining");

        if let Some(handle) = self.listener_handle.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "Notification listener task panicked");
            }
        }
        if let Some(handle) = self.poller_handle.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "Poller task panicked");
            }
        }

        // Locked but never started: hand their claims back.
        let drained = self.job_queue.stop();
        release_descriptors(&self.lock_conn, &self.registry, &drained).await;

        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = ?e, "Worker task panicked");
            }
        }

        // Completions signalled while we were draining.
        while let Ok(job_id) = self.result_rx.try_recv() {
            self.finish_job(job_id).await;
        }

        // Conservative sweep of anything the bookkeeping still holds.
        for job_id in self.registry.snapshot() {
            self.finish_job(job_id).await;
        }

        {
            let mut conn = self.lock_conn.lock().await;
            match deregister_locker(&mut conn).await {
                Ok(1) => {}
                Ok(_) => warn!("Locker registration row was already gone"),
                Err(e) => error!(error = %e, "Failed to delete locker registration row"),
            }
        }

        info!(event = "locker_stop", "Locker stopped");
        let _ = self.state_tx.send(LockerState::Stopped);
    }
}
