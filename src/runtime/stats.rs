//! Runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    pub tasks_created: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub events_created: AtomicU64,
    pub events_satisfied: AtomicU64,
    pub data_objects_created: AtomicU64,
    pub data_objects_freed: AtomicU64,
    pub remote_sent: AtomicU64,
    pub remote_received: AtomicU64,
}

/// Point-in-time copy of [`RuntimeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub events_created: u64,
    pub events_satisfied: u64,
    pub data_objects_created: u64,
    pub data_objects_freed: u64,
    pub remote_sent: u64,
    pub remote_received: u64,
}

impl RuntimeStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            tasks_created: load(&self.tasks_created),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            events_created: load(&self.events_created),
            events_satisfied: load(&self.events_satisfied),
            data_objects_created: load(&self.data_objects_created),
            data_objects_freed: load(&self.data_objects_freed),
            remote_sent: load(&self.remote_sent),
            remote_received: load(&self.remote_received),
        }
    }
}
