//! Task templates, task instances and the dependency-slot engine.
//!
//! A task becomes runnable exactly once: every slot resolution decrements an
//! atomic counter, and only the resolution that takes it from one to zero moves
//! the task from `Pending` to `Ready` and hands it to the scheduler.

pub mod builder;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::context::TaskContext;
use crate::runtime::datablock::{AccessMode, DataHandle};
use crate::runtime::guid::Guid;

/// Body of a task: `(context, params, dependencies) -> return value`.
pub type TaskBody = dyn Fn(&TaskContext<'_>, &[u64], &[Dependency]) -> RuntimeResult<Guid> + Send + Sync;

/// Declared parameter or dependency count of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u32),
    /// Fixed per instance at creation time.
    Variadic,
}

/// Requested count when creating a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotCount {
    /// Use the template's declared count.
    #[default]
    TemplateDefault,
    Exactly(u32),
}

impl Arity {
    /// Reconcile the template's declaration with a creation request.
    pub(crate) fn resolve(
        self,
        template: Guid,
        what: &'static str,
        requested: SlotCount,
    ) -> RuntimeResult<u32> {
        match (self, requested) {
            (Arity::Fixed(n), SlotCount::TemplateDefault) => Ok(n),
            (Arity::Fixed(n), SlotCount::Exactly(m)) if n == m => Ok(n),
            (Arity::Fixed(n), SlotCount::Exactly(m)) => Err(RuntimeError::ArityMismatch {
                template,
                what,
                expected: n,
                actual: m,
            }),
            (Arity::Variadic, SlotCount::Exactly(m)) => Ok(m),
            (Arity::Variadic, SlotCount::TemplateDefault) => Err(RuntimeError::UnknownArity(template)),
        }
    }
}

/// Immutable description of a kind of task.
pub struct Template {
    guid: Guid,
    name: String,
    params: Arity,
    deps: Arity,
    body: Arc<TaskBody>,
}

impl fmt::Debug for Template {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Template")
            .field("guid", &self.guid)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("deps", &self.deps)
            .finish()
    }
}

impl Template {
    pub(crate) fn new(
        guid: Guid,
        name: impl Into<String>,
        params: Arity,
        deps: Arity,
        body: Arc<TaskBody>,
    ) -> Self {
        Self {
            guid,
            name: name.into(),
            params,
            deps,
            body,
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> Arity {
        self.params
    }

    #[inline]
    pub fn deps(&self) -> Arity {
        self.deps
    }

    #[inline]
    pub(crate) fn body(&self) -> &TaskBody {
        &*self.body
    }
}

/// Task state (stored atomically).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for slot resolutions.
    Pending,
    /// All slots resolved, handed to the scheduler.
    Ready,
    Running,
    Completed,
    /// Destroyed before it was released.
    Cancelled,
}

impl TaskState {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Pending,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Ready => 1,
            TaskState::Running => 2,
            TaskState::Completed => 3,
            TaskState::Cancelled => 4,
        }
    }
}

/// Task properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskProperties {
    #[default]
    Ordinary,
    /// Completion also waits for every task transitively created in its scope.
    Finish,
}

/// Resolved value of one dependency slot.
#[derive(Debug, Clone)]
pub struct Dependency {
    guid: Guid,
    mode: AccessMode,
    data: Option<DataHandle>,
}

impl Dependency {
    pub(crate) fn new(
        guid: Guid,
        mode: AccessMode,
        data: Option<DataHandle>,
    ) -> Self {
        Self { guid, mode, data }
    }

    /// Delivered payload, [`Guid::NULL`] for a pure control dependency.
    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Storage of a delivered local data object.
    #[inline]
    pub fn data(&self) -> Option<&DataHandle> {
        self.data.as_ref()
    }
}

/// Latch and continuation owned by a finish task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishScope {
    pub latch: Guid,
    pub continuation: Guid,
}

struct DepSlot {
    wired: AtomicBool,
    value: OnceLock<Dependency>,
}

/// Everything a task instance is created with.
#[derive(Debug)]
pub(crate) struct TaskSpec {
    pub params: Vec<u64>,
    pub slots: u32,
    pub properties: TaskProperties,
    /// Latch of the enclosing finish scope.
    pub finish_parent: Option<Guid>,
    pub scope: Option<FinishScope>,
    pub output_event: Option<Guid>,
}

/// A task instance.
pub struct Task {
    guid: Guid,
    template: Arc<Template>,
    params: Box<[u64]>,
    slots: Box<[DepSlot]>,
    remaining: AtomicU32,
    state: AtomicU8,
    properties: TaskProperties,
    finish_parent: Option<Guid>,
    scope: Option<FinishScope>,
    output_event: Option<Guid>,
    held: Mutex<SmallVec<[Guid; 4]>>,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("guid", &self.guid)
            .field("template", &self.template.name())
            .field("state", &self.state())
            .field("remaining", &self.remaining())
            .field("properties", &self.properties)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        guid: Guid,
        template: Arc<Template>,
        spec: TaskSpec,
    ) -> Self {
        let slots = (0..spec.slots)
            .map(|_| DepSlot {
                wired: AtomicBool::new(false),
                value: OnceLock::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            guid,
            template,
            params: spec.params.into_boxed_slice(),
            slots,
            remaining: AtomicU32::new(spec.slots),
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            properties: spec.properties,
            finish_parent: spec.finish_parent,
            scope: spec.scope,
            output_event: spec.output_event,
            held: Mutex::new(SmallVec::new()),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    #[inline]
    pub fn params(&self) -> &[u64] {
        &self.params
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slots still awaiting resolution.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn properties(&self) -> TaskProperties {
        self.properties
    }

    #[inline]
    pub fn finish_parent(&self) -> Option<Guid> {
        self.finish_parent
    }

    #[inline]
    pub fn scope(&self) -> Option<FinishScope> {
        self.scope
    }

    #[inline]
    pub fn output_event(&self) -> Option<Guid> {
        self.output_event
    }

    /// Scope inherited by tasks this task creates.
    pub fn child_scope(&self) -> Option<Guid> {
        match self.scope {
            Some(scope) => Some(scope.latch),
            None => self.finish_parent,
        }
    }

    fn slot(
        &self,
        slot: u32,
    ) -> RuntimeResult<&DepSlot> {
        self.slots
            .get(slot as usize)
            .ok_or(RuntimeError::SlotOutOfRange {
                guid: self.guid,
                slot,
                count: self.slot_count(),
            })
    }

    /// Claim `slot` for a new dependency edge.
    pub(crate) fn wire(
        &self,
        slot: u32,
    ) -> RuntimeResult<()> {
        let cell = self.slot(slot)?;
        if cell.value.get().is_some() {
            return Err(RuntimeError::SlotAlreadyResolved {
                task: self.guid,
                slot,
            });
        }
        if cell.wired.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::SlotAlreadyWired {
                task: self.guid,
                slot,
            });
        }
        Ok(())
    }

    /// Give back a claim whose edge could not be completed.
    pub(crate) fn unwire(
        &self,
        slot: u32,
    ) {
        if let Some(cell) = self.slots.get(slot as usize) {
            cell.wired.store(false, Ordering::Release);
        }
    }

    /// Record the value of `slot`.
    ///
    /// Returns `true` for the single resolution that released the task.
    pub(crate) fn resolve_slot(
        &self,
        slot: u32,
        dependency: Dependency,
    ) -> RuntimeResult<bool> {
        let cell = self.slot(slot)?;
        cell.value
            .set(dependency)
            .map_err(|_| RuntimeError::SlotAlreadyResolved {
                task: self.guid,
                slot,
            })?;
        let before = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| RuntimeError::DependencyOverflow(self.guid))?;
        Ok(before == 1 && self.transition(TaskState::Pending, TaskState::Ready))
    }

    /// A task with no slots is ready as soon as it exists.
    pub(crate) fn release_if_unblocked(&self) -> bool {
        self.slots.is_empty() && self.transition(TaskState::Pending, TaskState::Ready)
    }

    pub(crate) fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_state(
        &self,
        state: TaskState,
    ) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Resolved dependencies in slot order.
    pub(crate) fn dependencies(&self) -> Vec<Dependency> {
        self.slots
            .iter()
            .map(|cell| {
                cell.value
                    .get()
                    .cloned()
                    .unwrap_or_else(|| Dependency::new(Guid::NULL, AccessMode::Null, None))
            })
            .collect()
    }

    /// Remember a data-object reference this task must drop on completion.
    pub(crate) fn note_held(
        &self,
        guid: Guid,
    ) {
        self.held.lock().push(guid);
    }

    /// Forget one held reference; returns whether it was recorded.
    pub(crate) fn forget_held(
        &self,
        guid: Guid,
    ) -> bool {
        let mut held = self.held.lock();
        match held.iter().position(|g| *g == guid) {
            Some(index) => {
                held.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_held(&self) -> SmallVec<[Guid; 4]> {
        std::mem::take(&mut *self.held.lock())
    }
}
