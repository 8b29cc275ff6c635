use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The in-memory representation of a locked job.
///
/// A descriptor carries only the three columns that make up the queue sort
/// key. The job runner re-reads the full row under the advisory lock the
/// locker already holds, so nothing else needs to travel through the queue.
///
/// Descriptors order ascending by `(priority, run_at, job_id)`: lower
/// priority numbers are more urgent, ties break on the earlier `run_at`,
/// then on the smaller id.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct JobDescriptor {
    /// Lower number means it should run sooner
    priority: i16,
    /// When the job is due to run
    run_at: DateTime<Utc>,
    /// Unique identifier for the job, also the advisory lock key
    job_id: i64,
}

impl JobDescriptor {
    pub fn new(priority: i16, run_at: DateTime<Utc>, job_id: i64) -> Self {
        Self {
            priority,
            run_at,
            job_id,
        }
    }

    fn sort_key(&self) -> (i16, DateTime<Utc>, i64) {
        (self.priority, self.run_at, self.job_id)
    }
}

impl Ord for JobDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for JobDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A full `jobs` row, as re-read by job runners under the advisory lock.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct JobRow {
    job_id: i64,
    priority: i16,
    run_at: DateTime<Utc>,
    /// Name the job body was registered under
    job_class: String,
    /// The JSON arguments of the job
    args: serde_json::Value,
    /// How many times this job has errored so far
    error_count: i32,
    /// If error_count > 0, why did it fail last ?
    last_error: Option<String>,
}

/// Type alias for the job invocation callback.
///
/// The callback receives the descriptor of a job whose advisory lock this
/// process holds and performs all database work itself (re-reading the row,
/// running the job body, recording the outcome). The string in the error
/// case is the failure message; failures never reach the locker beyond
/// being logged by the worker that ran the job.
pub type JobRunner = Arc<
    dyn Fn(JobDescriptor) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// Callback invoked once per worker, from that worker's own task, with the
/// worker's index.
pub type WorkerStartFn = Arc<dyn Fn(usize) + Send + Sync>;
