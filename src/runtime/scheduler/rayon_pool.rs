//! Scheduler backed by a rayon thread pool.

use std::sync::Arc;
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{ReadyTask, Scheduler, SchedulerStats};
use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug)]
pub struct RayonScheduler {
    pool: ThreadPool,
    stats: Arc<SchedulerStats>,
}

impl RayonScheduler {
    pub fn new(num_threads: usize) -> RuntimeResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("epochrt-rayon-{}", index))
            .build()
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        Ok(Self {
            pool,
            stats: Arc::new(SchedulerStats::default()),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Scheduler for RayonScheduler {
    fn release_ready(
        &self,
        task: ReadyTask,
    ) {
        self.stats.record_scheduled();
        let stats = self.stats.clone();
        self.pool.spawn(move || {
            let start = Instant::now();
            task.run();
            stats.record_completed(start.elapsed().as_micros() as usize);
        });
    }

    fn name(&self) -> &'static str {
        "rayon"
    }

    fn stats(&self) -> Option<&SchedulerStats> {
        Some(self.stats.as_ref())
    }
}
