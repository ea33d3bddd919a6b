//! Live worker registry.
//!
//! Readers take a lock-free snapshot per dispatch; membership changes swap in
//! a new vector. Order is registration order, which is the order round-robin
//! walks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cluster::channel::WorkerChannel;
use crate::observability::metrics;

/// Identity of a registered worker, unique for the master's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A connected worker process.
#[derive(Debug)]
pub struct WorkerEntry {
    id: WorkerId,
    pid: u32,
    channel: WorkerChannel,
}

impl WorkerEntry {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn channel(&self) -> &WorkerChannel {
        &self.channel
    }
}

pub struct WorkerRegistry {
    workers: ArcSwap<Vec<Arc<WorkerEntry>>>,
    next_id: AtomicU64,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a worker at the end of the rotation.
    pub fn register(&self, pid: u32, channel: WorkerChannel) -> Arc<WorkerEntry> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(WorkerEntry { id, pid, channel });

        self.workers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&entry));
            next
        });

        let count = self.len();
        metrics::record_workers(count);
        tracing::info!(worker_id = %id, pid, workers = count, "Worker registered");
        entry
    }

    /// Remove a worker. Returns the entry if it was present.
    pub fn deregister(&self, id: WorkerId) -> Option<Arc<WorkerEntry>> {
        let mut removed = None;
        self.workers.rcu(|current| {
            let mut next = Vec::clone(current);
            removed = next
                .iter()
                .position(|worker| worker.id == id)
                .map(|index| next.remove(index));
            next
        });

        if let Some(entry) = &removed {
            let count = self.len();
            metrics::record_workers(count);
            tracing::info!(worker_id = %id, pid = entry.pid, workers = count, "Worker deregistered");
        }
        removed
    }

    /// Current workers, in rotation order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<WorkerEntry>>> {
        self.workers.load_full()
    }

    pub fn len(&self) -> usize {
        self.workers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
