//! Task creation and execution.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::RuntimeResult;
use crate::runtime::context::TaskContext;
use crate::runtime::event::LATCH_DECR_SLOT;
use crate::runtime::guid::{Guid, GuidKind, Object};
use crate::runtime::stats::RuntimeStats;
use crate::runtime::task::{Task, TaskSpec, TaskState, Template};
use crate::runtime::Runtime;

impl Runtime {
    /// Register a task instance. The task counts as outstanding until it
    /// completes or is cancelled.
    pub(crate) fn spawn_task(
        &self,
        template: Arc<Template>,
        spec: TaskSpec,
    ) -> RuntimeResult<Arc<Task>> {
        let (guid, object) = self.registry().create(GuidKind::Task, |guid| {
            Ok(Object::Task(Arc::new(Task::new(guid, template, spec))))
        })?;
        let Object::Task(task) = object else {
            unreachable!("task guid bound to another kind");
        };
        self.task_opened();
        RuntimeStats::bump(&self.stats().tasks_created);
        debug!(task = %guid, template = task.template().name(), slots = task.slot_count(), "task created");
        Ok(task)
    }

    /// Run a released task's body and complete it.
    pub(crate) fn execute(
        &self,
        task: Arc<Task>,
    ) {
        task.set_state(TaskState::Running);
        let template = task.template().clone();
        let deps = task.dependencies();
        let ctx = TaskContext::new(self, task.guid(), template.guid(), task.child_scope());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (template.body())(&ctx, task.params(), &deps)
        }));
        drop(deps);

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                error!(task = %task.guid(), template = template.name(), error = %e, "task body failed");
                RuntimeStats::bump(&self.stats().tasks_failed);
                Guid::NULL
            }
            Err(_) => {
                error!(task = %task.guid(), template = template.name(), "task body panicked");
                RuntimeStats::bump(&self.stats().tasks_failed);
                Guid::NULL
            }
        };
        self.complete(&task, value, TaskState::Completed);
    }

    /// Release held data, forward `value` and signal the enclosing scope.
    ///
    /// The output (or continuation) is fed before any latch is decremented, so
    /// whoever waits on a scope sees the results of everything inside it.
    pub(crate) fn complete(
        &self,
        task: &Arc<Task>,
        value: Guid,
        final_state: TaskState,
    ) {
        for held in task.take_held() {
            if let Err(e) = self.release_data(held, task.guid()) {
                debug!(task = %task.guid(), data = %held, error = %e, "held reference already gone");
            }
        }

        match task.scope() {
            Some(scope) => {
                self.forward_result(value, scope.continuation, 1);
                if let Err(e) = self.satisfy(scope.latch, Guid::NULL, LATCH_DECR_SLOT) {
                    warn!(task = %task.guid(), latch = %scope.latch, error = %e, "scope latch decrement failed");
                }
            }
            None => {
                if let Some(output) = task.output_event() {
                    self.forward_result(value, output, 0);
                }
                if let Some(parent) = task.finish_parent() {
                    if let Err(e) = self.satisfy(parent, Guid::NULL, LATCH_DECR_SLOT) {
                        warn!(task = %task.guid(), latch = %parent, error = %e, "scope latch decrement failed");
                    }
                }
            }
        }

        task.set_state(final_state);
        if final_state == TaskState::Completed {
            RuntimeStats::bump(&self.stats().tasks_completed);
        }
        if final_state == TaskState::Cancelled || !self.config().runtime.retain_completed_tasks {
            let _ = self.registry().remove(task.guid());
        }
        debug!(task = %task.guid(), state = ?final_state, %value, "task finished");
        self.task_closed();
    }
}
