//! Scheduler boundary
//!
//! The dependency engine hands every task that became ready to a
//! [`Scheduler`]. The runtime never assumes where or when the task runs, only
//! that each released task runs exactly once.

pub mod inline;
pub mod rayon_pool;
pub mod work_stealer;

pub use inline::InlineScheduler;
pub use rayon_pool::RayonScheduler;
pub use work_stealer::WorkStealingPool;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;
use crate::runtime::guid::Guid;

/// A task released by the dependency engine.
pub struct ReadyTask {
    guid: Guid,
    job: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for ReadyTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ReadyTask").field("guid", &self.guid).finish()
    }
}

impl ReadyTask {
    pub fn new<F>(
        guid: Guid,
        job: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            guid,
            job: Box::new(job),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Run the task body and its completion.
    #[inline]
    pub fn run(self) {
        (self.job)()
    }
}

/// Executes ready tasks.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Accept a task whose dependencies are all resolved.
    fn release_ready(
        &self,
        task: ReadyTask,
    );

    /// Stop accepting work and join any threads the scheduler owns.
    fn shutdown(&self) {}

    fn name(&self) -> &'static str;

    fn stats(&self) -> Option<&SchedulerStats> {
        None
    }
}

/// Which scheduler a runtime is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Run ready tasks on the releasing thread.
    #[default]
    Inline,
    WorkStealing,
    Rayon,
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(SchedulerKind::Inline),
            "work-stealing" | "work_stealing" | "pool" => Ok(SchedulerKind::WorkStealing),
            "rayon" => Ok(SchedulerKind::Rayon),
            other => Err(format!("unknown scheduler '{}'", other)),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            SchedulerKind::Inline => "inline",
            SchedulerKind::WorkStealing => "work-stealing",
            SchedulerKind::Rayon => "rayon",
        })
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Number of worker threads.
    pub num_workers: usize,
    /// Tasks taken per steal.
    pub steal_batch: usize,
    /// How long an idle worker parks before rechecking the queues.
    pub idle_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            kind: SchedulerKind::Inline,
            num_workers: num_cpus,
            steal_batch: 4,
            idle_timeout_ms: 1,
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn workers(&self) -> usize {
        self.num_workers.max(1)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}

/// Build the scheduler selected by `config`.
pub fn build(config: &SchedulerConfig) -> RuntimeResult<Arc<dyn Scheduler>> {
    let scheduler: Arc<dyn Scheduler> = match config.kind {
        SchedulerKind::Inline => Arc::new(InlineScheduler::new()),
        SchedulerKind::WorkStealing => Arc::new(WorkStealingPool::new(config)?),
        SchedulerKind::Rayon => Arc::new(RayonScheduler::new(config.workers())?),
    };
    Ok(scheduler)
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks scheduled.
    pub tasks_scheduled: AtomicUsize,
    /// Total tasks run.
    pub tasks_completed: AtomicUsize,
    /// Total tasks stolen.
    pub tasks_stolen: AtomicUsize,
    /// Total steal attempts.
    pub steal_attempts: AtomicUsize,
    /// Total successful steals.
    pub steal_success: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
}

impl SchedulerStats {
    /// Record a scheduled task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed task.
    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Record a steal attempt.
    #[inline]
    pub fn record_steal(
        &self,
        stolen: usize,
    ) {
        self.steal_attempts.fetch_add(1, Ordering::Relaxed);
        if stolen > 0 {
            self.steal_success.fetch_add(1, Ordering::Relaxed);
            self.tasks_stolen.fetch_add(stolen, Ordering::Relaxed);
        }
    }

    /// Get steal success rate.
    pub fn steal_success_rate(&self) -> f64 {
        let attempts = self.steal_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 1.0;
        }
        self.steal_success.load(Ordering::Relaxed) as f64 / attempts as f64
    }
}
