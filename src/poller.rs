use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::job_queue::JobQueue;
use crate::lock_registry::LockRegistry;
use crate::locker::{release_descriptors, release_job_lock, LockConn, ShutdownSignal};
use crate::sql::poll_jobs::poll_jobs;

/// The polling path: fills the job queue from the database in batches, on
/// startup, on the optional periodic timer, and whenever the coordinator
/// signals demand through `wake`.
pub(crate) struct Poller {
    pub(crate) job_queue: Arc<JobQueue>,
    pub(crate) registry: Arc<LockRegistry>,
    pub(crate) lock_conn: LockConn,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) shutdown: ShutdownSignal,
}

impl Poller {
    pub(crate) async fn run(self) {
        let mut shutdown = self.shutdown.clone();

        // Startup poll, before any timer or demand tick.
        self.poll_until_caught_up().await;

        loop {
            match self.poll_interval {
                Some(period) => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(period) => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
            self.poll_until_caught_up().await;
        }

        debug!("Poller stopped");
    }

    /// Polls repeatedly while each batch comes back full: a full batch may
    /// mean the table holds more due jobs than one batch could lock, so
    /// waiting for the next tick would strand them.
    async fn poll_until_caught_up(&self) {
        loop {
            match self.poll_batch().await {
                Ok(Some((limit, locked))) if locked == limit => continue,
                Ok(_) => break,
                Err(e) => {
                    // Abandon the batch; the next tick gets a fresh start.
                    error!(error = %e, "Batch poll failed");
                    break;
                }
            }
        }
    }

    async fn poll_batch(&self) -> Result<Option<(usize, usize)>> {
        let limit = self.job_queue.space();
        if limit == 0 {
            return Ok(None);
        }

        let excluded = self.registry.snapshot();
        let descriptors = {
            let mut conn = self.lock_conn.lock().await;
            poll_jobs(&mut conn, &excluded, limit as i64).await?
        };
        let locked = descriptors.len();

        let mut accepted = Vec::with_capacity(locked);
        for descriptor in descriptors {
            let job_id = *descriptor.job_id();
            if self.registry.try_insert(job_id) {
                accepted.push(descriptor);
            } else {
                // Lost the race with the notification path for this job;
                // the registry entry belongs to the winner.
                release_job_lock(&self.lock_conn, job_id).await;
            }
        }

        let spilled = self.job_queue.push(accepted);
        release_descriptors(&self.lock_conn, &self.registry, &spilled).await;

        info!(event = "locker_polled", limit, locked, "Polled for jobs");
        Ok(Some((limit, locked)))
    }
}
