//! Task creation builder.

use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::datablock::AccessMode;
use crate::runtime::event::{EventKind, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
use crate::runtime::guid::{Guid, GuidKind};
use crate::runtime::task::{SlotCount, TaskProperties, TaskSpec};
use crate::runtime::Runtime;

/// Guids handed back by [`TaskBuilder::spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub task: Guid,
    /// Satisfied with the task's return value (for a finish task: once its
    /// whole scope has completed).
    pub output_event: Option<Guid>,
}

/// Configures and creates one task instance.
///
/// ```no_run
/// # use epochrt::runtime::Runtime;
/// # use epochrt::Guid;
/// # let rt = Runtime::inline().unwrap();
/// # let template = rt.create_template("t", |_, _, _| Ok(Guid::NULL)).unwrap();
/// let spawned = rt
///     .task_builder(template)
///     .params([1, 2])
///     .slots(0)
///     .finish()
///     .with_output_event()
///     .spawn()
///     .unwrap();
/// # let _ = spawned;
/// ```
#[must_use = "a task builder does nothing until spawned"]
#[derive(Debug)]
pub struct TaskBuilder<'rt> {
    runtime: &'rt Runtime,
    template: Guid,
    params: Vec<u64>,
    slots: SlotCount,
    dependencies: Vec<Guid>,
    dependency_mode: AccessMode,
    properties: TaskProperties,
    output: Output,
    scope: Option<Guid>,
    creator: Guid,
}

/// Where the task's result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    None,
    /// A fresh `Once` event created with the task.
    Create,
    /// An event the caller already made.
    Existing(Guid),
}

impl<'rt> TaskBuilder<'rt> {
    pub(crate) fn new(
        runtime: &'rt Runtime,
        template: Guid,
    ) -> Self {
        Self {
            runtime,
            template,
            params: Vec::new(),
            slots: SlotCount::TemplateDefault,
            dependencies: Vec::new(),
            dependency_mode: AccessMode::default(),
            properties: TaskProperties::Ordinary,
            output: Output::None,
            scope: None,
            creator: Guid::NULL,
        }
    }

    pub fn params(
        mut self,
        params: impl Into<Vec<u64>>,
    ) -> Self {
        self.params = params.into();
        self
    }

    /// Number of dependency slots; required for variadic templates.
    pub fn slots(
        self,
        count: u32,
    ) -> Self {
        self.slot_count(SlotCount::Exactly(count))
    }

    pub fn slot_count(
        mut self,
        count: SlotCount,
    ) -> Self {
        self.slots = count;
        self
    }

    /// Sources wired to slots `0..n` as part of creation.
    pub fn dependencies(
        mut self,
        sources: impl IntoIterator<Item = Guid>,
    ) -> Self {
        self.dependencies = sources.into_iter().collect();
        self
    }

    /// Access mode used for data objects among the initial dependencies.
    pub fn dependency_mode(
        mut self,
        mode: AccessMode,
    ) -> Self {
        self.dependency_mode = mode;
        self
    }

    pub fn properties(
        mut self,
        properties: TaskProperties,
    ) -> Self {
        self.properties = properties;
        self
    }

    /// Make this a finish task.
    pub fn finish(self) -> Self {
        self.properties(TaskProperties::Finish)
    }

    /// Ask for an output event.
    pub fn with_output_event(mut self) -> Self {
        self.output = Output::Create;
        self
    }

    /// Deliver the result into `event` instead of a fresh output event.
    ///
    /// The event is not owned by the task: it is left in place if creation
    /// fails, and any kind accepting a satisfy on slot 0 will do.
    pub fn output_event_at(
        mut self,
        event: Guid,
    ) -> Self {
        self.output = Output::Existing(event);
        self
    }

    /// Join the finish scope whose latch is `latch`.
    pub fn in_scope(
        mut self,
        latch: Guid,
    ) -> Self {
        self.scope = Some(latch);
        self
    }

    pub(crate) fn created_by(
        mut self,
        task: Guid,
    ) -> Self {
        self.creator = task;
        self
    }

    /// Create the task.
    ///
    /// The enclosing scope's latch is incremented before this returns. Initial
    /// dependencies are wired in slot order; if wiring fails the task is
    /// cancelled before the error is returned, which closes its share of the
    /// scope. An output event created for it is discarded, a caller-supplied
    /// one is satisfied with null.
    pub fn spawn(self) -> RuntimeResult<Spawned> {
        let runtime = self.runtime;
        runtime.ensure_running()?;
        let template = runtime.resolve_template(self.template)?;
        template.params().resolve(
            template.guid(),
            "parameters",
            SlotCount::Exactly(self.params.len() as u32),
        )?;
        let slots = template.deps().resolve(template.guid(), "dependencies", self.slots)?;
        if self.dependencies.len() > slots as usize {
            return Err(RuntimeError::ArityMismatch {
                template: template.guid(),
                what: "initial dependencies",
                expected: slots,
                actual: self.dependencies.len() as u32,
            });
        }
        if let Output::Existing(event) = self.output {
            event.expect_kind(GuidKind::Event)?;
        }

        let parent = self.scope;
        if let Some(latch) = parent {
            runtime.satisfy(latch, Guid::NULL, LATCH_INCR_SLOT)?;
        }

        let created = (|| {
            let output = match self.output {
                Output::None => None,
                Output::Create => Some(runtime.new_event(EventKind::Once, 0, false)?),
                Output::Existing(event) => Some(event),
            };
            let discard_output = || {
                if let (Output::Create, Some(event)) = (self.output, output) {
                    let _ = runtime.registry().remove(event);
                }
            };
            let scope = match self.properties {
                TaskProperties::Finish => match runtime.open_scope(output, parent) {
                    Ok(scope) => Some(scope),
                    Err(e) => {
                        discard_output();
                        return Err(e);
                    }
                },
                TaskProperties::Ordinary => None,
            };
            let spec = TaskSpec {
                params: self.params,
                slots,
                properties: self.properties,
                finish_parent: parent,
                scope,
                output_event: output,
            };
            match runtime.spawn_task(template, spec) {
                Ok(task) => Ok((task, output)),
                Err(e) => {
                    if let Some(scope) = scope {
                        runtime.abort_scope(scope);
                    }
                    discard_output();
                    Err(e)
                }
            }
        })();

        let (task, output_event) = match created {
            Ok(created) => created,
            Err(e) => {
                if let Some(latch) = parent {
                    if let Err(undo) = runtime.satisfy(latch, Guid::NULL, LATCH_DECR_SLOT) {
                        warn!(%latch, error = %undo, "could not roll back scope increment");
                    }
                }
                return Err(e);
            }
        };
        debug!(task = %task.guid(), creator = %self.creator, scope = ?parent, "task spawned");

        for (slot, source) in self.dependencies.into_iter().enumerate() {
            if let Err(e) = runtime.add_dependency(source, task.guid(), slot as u32, self.dependency_mode) {
                warn!(task = %task.guid(), slot, %source, error = %e, "initial dependency rejected, cancelling task");
                if let Err(undo) = runtime.destroy(task.guid()) {
                    warn!(task = %task.guid(), error = %undo, "could not cancel partially wired task");
                }
                if let (Output::Create, Some(event)) = (self.output, output_event) {
                    let _ = runtime.registry().remove(event);
                }
                return Err(e);
            }
        }
        if task.release_if_unblocked() {
            runtime.release_ready(task.clone());
        }
        Ok(Spawned {
            task: task.guid(),
            output_event,
        })
    }
}

impl Runtime {
    /// Start building a task from `template`.
    pub fn task_builder(
        &self,
        template: Guid,
    ) -> TaskBuilder<'_> {
        TaskBuilder::new(self, template)
    }

    /// Create a task in one call.
    ///
    /// `dependencies` may be shorter than the slot count; the remaining slots
    /// are wired later with [`add_dependency`](Self::add_dependency).
    pub fn create_task(
        &self,
        template: Guid,
        params: &[u64],
        slots: SlotCount,
        dependencies: &[Guid],
        properties: TaskProperties,
        output_event: bool,
    ) -> RuntimeResult<Spawned> {
        let builder = self
            .task_builder(template)
            .params(params)
            .slot_count(slots)
            .dependencies(dependencies.iter().copied())
            .properties(properties);
        if output_event {
            builder.with_output_event().spawn()
        } else {
            builder.spawn()
        }
    }
}
