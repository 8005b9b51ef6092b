//! Execution context handed to task bodies.

use crate::error::RuntimeResult;
use crate::runtime::datablock::{AccessMode, DataHandle};
use crate::runtime::guid::Guid;
use crate::runtime::task::builder::TaskBuilder;
use crate::runtime::Runtime;

/// What a running task can see of the runtime.
///
/// Tasks created through the context join the task's finish scope, and data
/// objects created or acquired through it are released automatically when the
/// task completes.
#[derive(Debug)]
pub struct TaskContext<'rt> {
    runtime: &'rt Runtime,
    task: Guid,
    template: Guid,
    scope: Option<Guid>,
}

impl<'rt> TaskContext<'rt> {
    pub(crate) fn new(
        runtime: &'rt Runtime,
        task: Guid,
        template: Guid,
        scope: Option<Guid>,
    ) -> Self {
        Self {
            runtime,
            task,
            template,
            scope,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// Guid of the running task.
    #[inline]
    pub fn task(&self) -> Guid {
        self.task
    }

    /// Template the running task was created from; lets a body spawn
    /// instances of itself.
    #[inline]
    pub fn task_template(&self) -> Guid {
        self.template
    }

    /// Latch that tasks created from here increment.
    #[inline]
    pub fn finish_scope(&self) -> Option<Guid> {
        self.scope
    }

    #[inline]
    pub fn node(&self) -> u16 {
        self.runtime.node()
    }

    /// Start building a task that joins this task's scope.
    pub fn task_builder(
        &self,
        template: Guid,
    ) -> TaskBuilder<'rt> {
        let builder = self.runtime.task_builder(template).created_by(self.task);
        match self.scope {
            Some(latch) => builder.in_scope(latch),
            None => builder,
        }
    }

    /// Create a data object held by this task.
    pub fn create_data_object(
        &self,
        len: usize,
    ) -> RuntimeResult<(Guid, DataHandle)> {
        self.runtime.create_data_object_for(self.task, len)
    }

    /// Acquire a local data object for this task.
    pub fn acquire(
        &self,
        guid: Guid,
        mode: AccessMode,
    ) -> RuntimeResult<Option<DataHandle>> {
        self.runtime.acquire(guid, self.task, mode)
    }

    /// Release one reference this task holds on `guid` before completion.
    pub fn release(
        &self,
        guid: Guid,
    ) -> RuntimeResult<()> {
        self.runtime.release(guid, self.task)
    }

    pub fn satisfy(
        &self,
        event: Guid,
        payload: Guid,
        slot: u32,
    ) -> RuntimeResult<()> {
        self.runtime.satisfy(event, payload, slot)
    }

    pub fn add_dependency(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> RuntimeResult<()> {
        self.runtime.add_dependency(source, dest, slot, mode)
    }

    /// Ask the runtime to terminate.
    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}
