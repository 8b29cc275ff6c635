use std::collections::HashSet;
use std::sync::Mutex;

/// In-memory set of the job ids whose advisory locks this process holds.
///
/// The notification listener and the poller can race for the same job; the
/// atomic test-and-set of [`try_insert`](Self::try_insert) decides the
/// winner, and the loser releases its redundant database lock.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<i64>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `job_id` for this process. Returns false when the id was
    /// already present, in which case the caller must not keep its lock.
    pub fn try_insert(&self, job_id: i64) -> bool {
        self.held.lock().unwrap().insert(job_id)
    }

    pub fn remove(&self, job_id: i64) -> bool {
        self.held.lock().unwrap().remove(&job_id)
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.held.lock().unwrap().contains(&job_id)
    }

    /// Sorted copy of the held ids, used to exclude them from batch polls.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.held.lock().unwrap().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().unwrap().is_empty()
    }
}
