use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::job::JobDescriptor;

/// Outcome of a blocking [`JobQueue::pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    /// The most urgent descriptor the caller's ceiling admits
    Job(JobDescriptor),
    /// The queue was stopped; the caller should exit its loop
    Stopped,
}

struct Waiter {
    ceiling: Option<i16>,
    tx: oneshot::Sender<Popped>,
}

struct Shared {
    jobs: BTreeSet<JobDescriptor>,
    waiters: VecDeque<Waiter>,
    stopped: bool,
}

/// Bounded, priority-ordered container of locked job descriptors.
///
/// Producers (the poller and the notification listener) push descriptors
/// whose advisory locks this process already holds; workers pop them, most
/// urgent first, optionally restricted by a priority ceiling. When a push
/// overflows the capacity the least urgent descriptors are spilled back to
/// the caller, which is responsible for releasing their locks.
///
/// The internal mutex is only ever held for in-memory bookkeeping, never
/// across a database call.
pub struct JobQueue {
    shared: Mutex<Shared>,
    max_size: usize,
}

impl JobQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                jobs: BTreeSet::new(),
                waiters: VecDeque::new(),
                stopped: false,
            }),
            max_size,
        }
    }

    /// Merges descriptors into the queue.
    ///
    /// Parked workers are served first, in arrival order, each receiving the
    /// most urgent descriptor its ceiling admits. Whatever remains is
    /// inserted, and if the queue then exceeds its capacity the greatest
    /// (least urgent) descriptors are evicted and returned; the caller must
    /// release their advisory locks.
    ///
    /// After [`stop`](Self::stop) the queue accepts nothing: the input comes
    /// back untouched for lock release.
    pub fn push(&self, descriptors: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
        let mut shared = self.shared.lock().unwrap();

        if shared.stopped {
            return descriptors;
        }

        shared.jobs.extend(descriptors);

        let mut index = 0;
        while index < shared.waiters.len() {
            let ceiling = shared.waiters[index].ceiling;
            let Some(descriptor) = first_eligible(&shared.jobs, ceiling) else {
                index += 1;
                continue;
            };
            shared.jobs.remove(&descriptor);
            let waiter = shared
                .waiters
                .remove(index)
                .expect("waiter index checked above");
            if let Err(Popped::Job(descriptor)) = waiter.tx.send(Popped::Job(descriptor)) {
                // The worker gave up waiting; keep the descriptor queued.
                shared.jobs.insert(descriptor);
            }
        }

        let mut spilled = Vec::new();
        while shared.jobs.len() > self.max_size {
            let Some(worst) = shared.jobs.pop_last() else {
                break;
            };
            spilled.push(worst);
        }
        spilled
    }

    /// Removes and returns the most urgent descriptor whose priority is
    /// numerically at most `ceiling` (any priority when `None`), waiting
    /// until one arrives. Returns [`Popped::Stopped`] once the queue has
    /// been stopped.
    pub async fn pop(&self, ceiling: Option<i16>) -> Popped {
        let rx = {
            let mut shared = self.shared.lock().unwrap();
            if shared.stopped {
                return Popped::Stopped;
            }
            if let Some(descriptor) = first_eligible(&shared.jobs, ceiling) {
                shared.jobs.remove(&descriptor);
                return Popped::Job(descriptor);
            }
            let (tx, rx) = oneshot::channel();
            shared.waiters.push_back(Waiter { ceiling, tx });
            rx
        };

        rx.await.unwrap_or(Popped::Stopped)
    }

    /// The least urgent (numerically greatest) priority currently queued.
    ///
    /// Producers consult this before bothering to lock a candidate that
    /// would not displace anything from a full queue.
    pub fn lowest_priority(&self) -> Option<i16> {
        let shared = self.shared.lock().unwrap();
        shared.jobs.last().map(|descriptor| *descriptor.priority())
    }

    pub fn size(&self) -> usize {
        self.shared.lock().unwrap().jobs.len()
    }

    /// Free capacity, i.e. how many descriptors fit before a push spills.
    pub fn space(&self) -> usize {
        self.max_size.saturating_sub(self.size())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().unwrap().stopped
    }

    /// Current contents in queue order, for observability.
    pub fn snapshot(&self) -> Vec<JobDescriptor> {
        let shared = self.shared.lock().unwrap();
        shared.jobs.iter().cloned().collect()
    }

    /// Puts the queue into its terminal state: every parked and future pop
    /// yields [`Popped::Stopped`], and the remaining descriptors are drained
    /// and returned so the caller can release their advisory locks.
    pub fn stop(&self) -> Vec<JobDescriptor> {
        let mut shared = self.shared.lock().unwrap();
        shared.stopped = true;
        for waiter in shared.waiters.drain(..) {
            let _ = waiter.tx.send(Popped::Stopped);
        }
        std::mem::take(&mut shared.jobs).into_iter().collect()
    }
}

/// The most urgent descriptor a ceiling admits. Since the set orders by
/// priority first, only the overall minimum can qualify.
fn first_eligible(jobs: &BTreeSet<JobDescriptor>, ceiling: Option<i16>) -> Option<JobDescriptor> {
    let first = jobs.first()?;
    match ceiling {
        Some(max) if *first.priority() > max => None,
        _ => Some(first.clone()),
    }
}
