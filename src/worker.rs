use std::sync::Arc;

use getset::Getters;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::job::{JobRunner, WorkerStartFn};
use crate::job_queue::{JobQueue, Popped};

/// Read-only view of a spawned worker, exposed by the locker for
/// observability and tests.
#[derive(Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct WorkerInfo {
    /// Position of the worker in the pool
    index: usize,
    /// Maximum priority value the worker accepts, `None` for any
    priority_ceiling: Option<i16>,
}

pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) priority_ceiling: Option<i16>,
    pub(crate) job_queue: Arc<JobQueue>,
    pub(crate) results: mpsc::UnboundedSender<i64>,
    pub(crate) job_runner: JobRunner,
    pub(crate) on_start: Option<WorkerStartFn>,
}

impl Worker {
    pub(crate) fn spawn(self) -> (WorkerInfo, JoinHandle<()>) {
        let info = WorkerInfo {
            index: self.index,
            priority_ceiling: self.priority_ceiling,
        };
        (info, tokio::spawn(self.run()))
    }

    /// One descriptor at a time: pop, run, signal completion. The advisory
    /// lock is never touched here; releasing is the coordinator's job once
    /// the completion arrives on the result queue.
    async fn run(self) {
        if let Some(on_start) = &self.on_start {
            on_start(self.index);
        }

        loop {
            match self.job_queue.pop(self.priority_ceiling).await {
                Popped::Job(descriptor) => {
                    let job_id = *descriptor.job_id();
                    debug!(worker = self.index, job_id, "Working job");

                    if let Err(e) = (self.job_runner)(descriptor).await {
                        // The job body owns its failure pathway (retry,
                        // bury); the worker only records that it happened.
                        error!(worker = self.index, job_id, error = %e, "Job failed");
                    }

                    if self.results.send(job_id).is_err() {
                        debug!(worker = self.index, "Result queue closed, worker exiting");
                        break;
                    }
                }
                Popped::Stopped => break,
            }
        }

        debug!(worker = self.index, "Worker stopped");
    }
}
