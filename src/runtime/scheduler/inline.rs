//! Inline scheduler: ready tasks run on the thread that released them.
//!
//! Releasing a task from inside another task's completion would otherwise
//! recurse once per edge of the graph. The first release on a thread becomes a
//! trampoline that drains a thread-local queue; nested releases only enqueue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Instant;

use super::{ReadyTask, Scheduler, SchedulerStats};

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<ReadyTask>>> = const { RefCell::new(None) };
}

/// Clears the trampoline even if a task unwinds.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|queue| queue.borrow_mut().take());
    }
}

#[derive(Debug, Default)]
pub struct InlineScheduler {
    stats: SchedulerStats,
}

impl InlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(
        &self,
        task: ReadyTask,
    ) {
        let start = Instant::now();
        task.run();
        self.stats
            .record_completed(start.elapsed().as_micros() as usize);
    }
}

impl Scheduler for InlineScheduler {
    fn release_ready(
        &self,
        task: ReadyTask,
    ) {
        self.stats.record_scheduled();
        let first = TRAMPOLINE.with(|queue| {
            let mut queue = queue.borrow_mut();
            match queue.as_mut() {
                Some(pending) => {
                    pending.push_back(task);
                    None
                }
                None => {
                    *queue = Some(VecDeque::new());
                    Some(task)
                }
            }
        });
        let Some(first) = first else {
            return;
        };

        let _guard = DrainGuard;
        self.run(first);
        while let Some(next) = TRAMPOLINE.with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front)) {
            self.run(next);
        }
    }

    fn name(&self) -> &'static str {
        "inline"
    }

    fn stats(&self) -> Option<&SchedulerStats> {
        Some(&self.stats)
    }
}
