//! Work-stealing thread pool.
//!
//! Each worker owns a local deque. Tasks released from a worker thread go to
//! that worker's deque; tasks released from anywhere else go to the shared
//! injector. Idle workers drain the injector first, then steal batches from a
//! randomly chosen victim.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, trace};

use super::{ReadyTask, Scheduler, SchedulerConfig, SchedulerStats};
use crate::error::{RuntimeError, RuntimeResult};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// `(pool id, local deque)` of the worker running on this thread.
    static LOCAL: RefCell<Option<(usize, Worker<ReadyTask>)>> = const { RefCell::new(None) };
}

#[derive(Debug)]
struct Shared {
    id: usize,
    injector: Injector<ReadyTask>,
    stealers: Vec<Stealer<ReadyTask>>,
    running: AtomicBool,
    sleepers: Mutex<usize>,
    wake: Condvar,
    stats: SchedulerStats,
    steal_batch: usize,
    idle_timeout: Duration,
}

/// Work-stealing pool over crossbeam deques.
#[derive(Debug)]
pub struct WorkStealingPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkStealingPool {
    /// Spawn `config.workers()` worker threads.
    pub fn new(config: &SchedulerConfig) -> RuntimeResult<Self> {
        let num_workers = config.workers();
        let locals: Vec<Worker<ReadyTask>> = (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            running: AtomicBool::new(true),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
            stats: SchedulerStats::default(),
            steal_batch: config.steal_batch.max(1),
            idle_timeout: config.idle_timeout(),
        });

        let pool = Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        };
        for (index, local) in locals.into_iter().enumerate() {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("epochrt-worker-{}", index))
                .spawn(move || Self::worker_loop(shared, index, local))
                .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
            pool.workers.lock().push(handle);
        }
        debug!(workers = num_workers, "work-stealing pool started");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Worker thread main loop.
    fn worker_loop(
        shared: Arc<Shared>,
        index: usize,
        local: Worker<ReadyTask>,
    ) {
        LOCAL.with(|slot| *slot.borrow_mut() = Some((shared.id, local)));

        while shared.running.load(Ordering::Acquire) {
            if let Some(task) = Self::find_task(&shared, index) {
                let start = Instant::now();
                task.run();
                shared
                    .stats
                    .record_completed(start.elapsed().as_micros() as usize);
                continue;
            }

            let mut sleepers = shared.sleepers.lock();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            *sleepers += 1;
            shared.wake.wait_for(&mut sleepers, shared.idle_timeout);
            *sleepers -= 1;
        }

        LOCAL.with(|slot| slot.borrow_mut().take());
        trace!(worker = index, "worker exited");
    }

    /// Local deque, then the injector, then a random victim.
    fn find_task(
        shared: &Shared,
        index: usize,
    ) -> Option<ReadyTask> {
        LOCAL.with(|slot| {
            let slot = slot.borrow();
            let (_, local) = slot.as_ref()?;
            if let Some(task) = local.pop() {
                return Some(task);
            }

            loop {
                let mut retry = false;
                match shared
                    .injector
                    .steal_batch_with_limit_and_pop(local, shared.steal_batch)
                {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }

                let victims = shared.stealers.len();
                let start = rand::rng().random_range(0..victims);
                for offset in 0..victims {
                    let victim = (start + offset) % victims;
                    if victim == index {
                        continue;
                    }
                    match shared.stealers[victim].steal_batch_with_limit_and_pop(local, shared.steal_batch) {
                        Steal::Success(task) => {
                            shared.stats.record_steal(1 + local.len());
                            return Some(task);
                        }
                        Steal::Retry => retry = true,
                        Steal::Empty => {}
                    }
                }
                if victims > 1 {
                    shared.stats.record_steal(0);
                }
                if !retry {
                    return None;
                }
            }
        })
    }
}

impl Scheduler for WorkStealingPool {
    fn release_ready(
        &self,
        task: ReadyTask,
    ) {
        self.shared.stats.record_scheduled();
        let remote = LOCAL.with(|slot| match slot.try_borrow() {
            Ok(slot) => match slot.as_ref() {
                Some((id, local)) if *id == self.shared.id => {
                    local.push(task);
                    None
                }
                _ => Some(task),
            },
            Err(_) => Some(task),
        });
        if let Some(task) = remote {
            self.shared.injector.push(task);
        }
        if *self.shared.sleepers.lock() > 0 {
            self.shared.wake.notify_one();
        }
    }

    fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _sleepers = self.shared.sleepers.lock();
            self.shared.wake.notify_all();
        }
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!("work-stealing pool stopped");
    }

    fn name(&self) -> &'static str {
        "work-stealing"
    }

    fn stats(&self) -> Option<&SchedulerStats> {
        Some(&self.shared.stats)
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
