use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tracing::{debug, info, trace, warn};

use crate::job::JobDescriptor;
use crate::job_queue::JobQueue;
use crate::lock_registry::LockRegistry;
use crate::locker::{release_descriptors, LockConn, ShutdownSignal};
use crate::sql::advisory_lock::try_advisory_lock;

/// The notification path: a dedicated connection subscribed to this
/// locker's `locker_<pid>` channel, turning targeted notifications into
/// locked descriptors on the job queue.
pub(crate) struct Listener {
    pub(crate) pg_listener: PgListener,
    pub(crate) channel: String,
    pub(crate) job_queue: Arc<JobQueue>,
    pub(crate) registry: Arc<LockRegistry>,
    pub(crate) lock_conn: LockConn,
    pub(crate) shutdown: ShutdownSignal,
}

impl Listener {
    pub(crate) async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                notification = self.pg_listener.recv() => match notification {
                    Ok(notification) => self.handle_payload(notification.payload()).await,
                    Err(e) => {
                        // recv re-establishes the connection (and the
                        // subscription) on the next call.
                        warn!(error = %e, "Notification connection error");
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        if let Err(e) = self.pg_listener.unlisten(&self.channel).await {
            debug!(error = %e, "Failed to unlisten before shutdown");
        }
        debug!("Notification listener stopped");
    }

    async fn handle_payload(&self, payload: &str) {
        let descriptor: JobDescriptor = match serde_json::from_str(payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(payload, error = %e, "Discarding malformed notification");
                return;
            }
        };
        let job_id = *descriptor.job_id();

        // Not worth a lock attempt when a full queue would spill the
        // candidate right back out.
        if self.job_queue.space() == 0 {
            if let Some(lowest) = self.job_queue.lowest_priority() {
                if *descriptor.priority() >= lowest {
                    trace!(job_id, "Queue full and candidate not urgent enough");
                    return;
                }
            }
        }

        if !self.registry.try_insert(job_id) {
            trace!(job_id, "Job already held by this process");
            return;
        }

        let locked = {
            let mut conn = self.lock_conn.lock().await;
            try_advisory_lock(&mut conn, job_id).await
        };
        match locked {
            Ok(true) => {}
            Ok(false) => {
                self.registry.remove(job_id);
                trace!(job_id, "Advisory lock held elsewhere");
                return;
            }
            Err(e) => {
                self.registry.remove(job_id);
                warn!(job_id, error = %e, "Advisory lock attempt failed");
                return;
            }
        }

        info!(
            event = "job_notified",
            job.priority = *descriptor.priority(),
            job.run_at = %descriptor.run_at(),
            job.job_id = job_id,
            "Job notified"
        );

        let spilled = self.job_queue.push(vec![descriptor]);
        release_descriptors(&self.lock_conn, &self.registry, &spilled).await;
    }
}
