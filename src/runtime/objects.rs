//! Object lifecycle: creation, data-object access and destruction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::comm::{Operation, RemoteMessage};
use crate::runtime::context::TaskContext;
use crate::runtime::datablock::{AccessMode, DataHandle, DataObject};
use crate::runtime::event::{Event, EventKind, ReduceOp};
use crate::runtime::guid::{Guid, GuidKind, GuidRange, Object};
use crate::runtime::stats::RuntimeStats;
use crate::runtime::task::{Arity, Dependency, TaskState, Template};
use crate::runtime::Runtime;

impl Runtime {
    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Register a task body accepting any number of parameters and slots.
    pub fn create_template<F>(
        &self,
        name: &str,
        body: F,
    ) -> RuntimeResult<Guid>
    where
        F: Fn(&TaskContext<'_>, &[u64], &[Dependency]) -> RuntimeResult<Guid> + Send + Sync + 'static,
    {
        self.create_template_with_arity(name, Arity::Variadic, Arity::Variadic, body)
    }

    /// Register a task body with declared parameter and dependency counts.
    pub fn create_template_with_arity<F>(
        &self,
        name: &str,
        params: Arity,
        deps: Arity,
        body: F,
    ) -> RuntimeResult<Guid>
    where
        F: Fn(&TaskContext<'_>, &[u64], &[Dependency]) -> RuntimeResult<Guid> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let (guid, _) = self.registry().create(GuidKind::TaskTemplate, |guid| {
            Ok(Object::Template(Arc::new(Template::new(
                guid,
                name,
                params,
                deps,
                Arc::new(body),
            ))))
        })?;
        debug!(template = %guid, name, "template registered");
        Ok(guid)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Create an event of `kind`. Latches start at zero, counted events
    /// expect a single subscriber and collective events a single contributor.
    pub fn create_event(
        &self,
        kind: EventKind,
    ) -> RuntimeResult<Guid> {
        self.new_event(kind, default_arg(kind), false)
    }

    /// Create a latch event with `initial` outstanding increments.
    pub fn create_latch(
        &self,
        initial: u32,
    ) -> RuntimeResult<Guid> {
        self.new_event(EventKind::Latch, initial, false)
    }

    /// Create a counted event retired after `expected` subscribers.
    pub fn create_counted(
        &self,
        expected: u32,
    ) -> RuntimeResult<Guid> {
        self.new_event(EventKind::Counted, expected, false)
    }

    pub(crate) fn new_event(
        &self,
        kind: EventKind,
        arg: u32,
        runtime_owned: bool,
    ) -> RuntimeResult<Guid> {
        self.ensure_running()?;
        let (guid, _) = self.registry().create(GuidKind::Event, |guid| {
            Ok(Object::Event(Arc::new(Event::new(guid, kind, arg, runtime_owned))))
        })?;
        RuntimeStats::bump(&self.stats().events_created);
        Ok(guid)
    }

    /// Create a collective event reducing one contribution from each of
    /// `contributors` slots with `op`.
    ///
    /// A contribution is the first `f64` of a local data object, or nothing
    /// when satisfied with null. Every completed round delivers a new data
    /// object holding the result to the subscribers registered during that
    /// round, then the event starts over. Result objects belong to whoever
    /// consumes them and are destroyed like any other.
    pub fn create_collective(
        &self,
        contributors: u32,
        op: ReduceOp,
    ) -> RuntimeResult<Guid> {
        self.ensure_running()?;
        let (guid, _) = self.registry().create(GuidKind::Event, |guid| {
            Ok(Object::Event(Arc::new(Event::collective(guid, contributors, op))))
        })?;
        RuntimeStats::bump(&self.stats().events_created);
        debug!(event = %guid, contributors, ?op, "collective event created");
        Ok(guid)
    }

    // ------------------------------------------------------------------
    // Data objects
    // ------------------------------------------------------------------

    /// Create a zeroed data object of `len` bytes, held by the caller.
    ///
    /// The caller's reference is dropped by [`destroy`](Self::destroy).
    pub fn create_data_object(
        &self,
        len: usize,
    ) -> RuntimeResult<(Guid, DataHandle)> {
        self.create_data_object_for(Guid::NULL, len)
    }

    /// Create a data object held by `task`; the reference is released when the
    /// task completes.
    pub(crate) fn create_data_object_for(
        &self,
        task: Guid,
        len: usize,
    ) -> RuntimeResult<(Guid, DataHandle)> {
        self.ensure_running()?;
        let max_len = self.config().runtime.max_data_object_bytes;
        let (guid, object) = self.registry().create(GuidKind::DataObject, |guid| {
            Ok(Object::DataObject(Arc::new(DataObject::new(guid, task, len, max_len)?)))
        })?;
        let Object::DataObject(object) = object else {
            unreachable!("data object guid bound to another kind");
        };
        self.note_held_by(task, guid);
        RuntimeStats::bump(&self.stats().data_objects_created);
        debug!(%guid, len, creator = %task, "data object created");
        Ok((guid, DataHandle::new(object, AccessMode::ReadWrite)))
    }

    /// Acquire `guid` on behalf of `task` ([`Guid::NULL`] outside any task).
    ///
    /// Returns `None` when the object lives on another node: the acquisition
    /// is recorded by its home node but no storage is mapped here.
    pub fn acquire(
        &self,
        guid: Guid,
        task: Guid,
        mode: AccessMode,
    ) -> RuntimeResult<Option<DataHandle>> {
        guid.expect_kind(GuidKind::DataObject)?;
        if !self.is_local(guid) {
            let message = RemoteMessage::new(Operation::Acquire, self.node(), guid)
                .with_requester(task)
                .with_mode(mode);
            self.send_remote(guid.node(), message)?;
            self.note_held_by(task, guid);
            return Ok(None);
        }
        let object = self.resolve_data(guid)?;
        object.acquire(task, mode)?;
        self.note_held_by(task, guid);
        Ok(Some(DataHandle::new(object, mode)))
    }

    /// Drop one reference `task` holds on `guid`.
    pub fn release(
        &self,
        guid: Guid,
        task: Guid,
    ) -> RuntimeResult<()> {
        guid.expect_kind(GuidKind::DataObject)?;
        if !task.is_null() && self.is_local(task) {
            if let Ok(holder) = self.resolve_task(task) {
                holder.forget_held(guid);
            }
        }
        self.release_data(guid, task)
    }

    /// Release without touching the holder's bookkeeping.
    pub(crate) fn release_data(
        &self,
        guid: Guid,
        task: Guid,
    ) -> RuntimeResult<()> {
        if !self.is_local(guid) {
            let message = RemoteMessage::new(Operation::Release, self.node(), guid).with_requester(task);
            return self.send_remote(guid.node(), message);
        }
        let object = self.resolve_data(guid)?;
        if object.release(task)? {
            self.retire_data(guid);
        }
        Ok(())
    }

    fn note_held_by(
        &self,
        task: Guid,
        guid: Guid,
    ) {
        if task.is_null() || !self.is_local(task) {
            return;
        }
        if let Ok(holder) = self.resolve_task(task) {
            holder.note_held(guid);
        }
    }

    fn retire_data(
        &self,
        guid: Guid,
    ) {
        if self.registry().remove(guid).is_ok() {
            RuntimeStats::bump(&self.stats().data_objects_freed);
            debug!(%guid, "data object freed");
        }
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Destroy the object named by `guid`.
    ///
    /// * data object: marks it for destruction; storage goes once every holder
    ///   has released it
    /// * event: removed at once; waiters still parked on it are dropped
    /// * task: only while still pending; it is cancelled without running and
    ///   its scope and output are signalled as if it had returned null
    /// * range: drops the slots that were never instantiated
    pub fn destroy(
        &self,
        guid: Guid,
    ) -> RuntimeResult<()> {
        if !guid.is_null() && !self.is_local(guid) {
            let message = RemoteMessage::new(Operation::Destroy, self.node(), guid);
            return self.send_remote(guid.node(), message);
        }
        match guid.kind() {
            GuidKind::DataObject => {
                let object = self.resolve_data(guid)?;
                if object.request_destroy()? {
                    self.retire_data(guid);
                }
                Ok(())
            }
            GuidKind::Event => {
                let Object::Event(event) = self.registry().remove(guid)? else {
                    unreachable!("event guid bound to another kind");
                };
                let stranded = event.abandon();
                if stranded > 0 {
                    warn!(event = %guid, stranded, "event destroyed with waiters still parked");
                }
                Ok(())
            }
            GuidKind::Task => {
                let task = self.resolve_task(guid)?;
                if !task.transition(TaskState::Pending, TaskState::Cancelled) {
                    return Err(RuntimeError::TaskAlreadyReleased(guid));
                }
                debug!(task = %guid, "task cancelled");
                self.complete(&task, Guid::NULL, TaskState::Cancelled);
                Ok(())
            }
            GuidKind::TaskTemplate => self.registry().remove(guid).map(drop),
            GuidKind::GuidRange => {
                let Object::Range(range) = self.registry().remove(guid)? else {
                    unreachable!("range guid bound to another kind");
                };
                let dropped = self.registry().release_reserved(&range);
                debug!(range = %guid, dropped, "range destroyed");
                Ok(())
            }
            GuidKind::None => Err(RuntimeError::UnknownGuid(guid)),
        }
    }

    // ------------------------------------------------------------------
    // Guid ranges
    // ------------------------------------------------------------------

    /// Reserve `len` Guids of `kind` (events or data objects) to be
    /// instantiated later.
    pub fn allocate_range(
        &self,
        kind: GuidKind,
        len: u64,
    ) -> RuntimeResult<Guid> {
        self.ensure_running()?;
        if !matches!(kind, GuidKind::Event | GuidKind::DataObject) {
            return Err(RuntimeError::KindMismatch {
                guid: Guid::NULL,
                expected: GuidKind::Event,
                actual: kind,
            });
        }
        let range = self.registry().reserve_range(kind, len)?;
        debug!(range = %range.guid(), %kind, len, "guid range reserved");
        Ok(range.guid())
    }

    /// The `index`-th Guid of `range`.
    pub fn guid_from_index(
        &self,
        range: Guid,
        index: u64,
    ) -> RuntimeResult<Guid> {
        self.resolve_range(range)?.guid_at(index)
    }

    fn resolve_range(
        &self,
        range: Guid,
    ) -> RuntimeResult<Arc<GuidRange>> {
        range.expect_kind(GuidKind::GuidRange)?;
        match self.registry().resolve(range)? {
            Object::Range(range) => Ok(range),
            other => Err(RuntimeError::KindMismatch {
                guid: range,
                expected: GuidKind::GuidRange,
                actual: other.kind(),
            }),
        }
    }

    /// Instantiate an event at a reserved Guid. Subscriptions made while the
    /// Guid was only reserved are registered on the new event.
    pub fn create_event_at(
        &self,
        guid: Guid,
        kind: EventKind,
    ) -> RuntimeResult<()> {
        self.bind_event(Event::new(guid, kind, default_arg(kind), false))
    }

    /// Instantiate a collective event at a reserved Guid.
    pub fn create_collective_at(
        &self,
        guid: Guid,
        contributors: u32,
        op: ReduceOp,
    ) -> RuntimeResult<()> {
        self.bind_event(Event::collective(guid, contributors, op))
    }

    fn bind_event(
        &self,
        event: Event,
    ) -> RuntimeResult<()> {
        self.ensure_running()?;
        let guid = event.guid();
        let kind = event.kind();
        let event = Arc::new(event);
        let pending = self.registry().bind(guid, Object::Event(event.clone()))?;
        RuntimeStats::bump(&self.stats().events_created);
        debug!(event = %guid, %kind, parked = pending.len(), "event instantiated at reserved guid");
        for waiter in pending {
            if let Err(e) = self.register_waiter(&event, waiter) {
                warn!(event = %guid, dest = %waiter.dest, error = %e, "parked subscription rejected");
            }
        }
        Ok(())
    }

    /// Instantiate a data object at a reserved Guid, held by the caller.
    pub fn create_data_object_at(
        &self,
        guid: Guid,
        len: usize,
    ) -> RuntimeResult<DataHandle> {
        self.ensure_running()?;
        let max_len = self.config().runtime.max_data_object_bytes;
        let object = Arc::new(DataObject::new(guid, Guid::NULL, len, max_len)?);
        self.registry().bind(guid, Object::DataObject(object.clone()))?;
        RuntimeStats::bump(&self.stats().data_objects_created);
        Ok(DataHandle::new(object, AccessMode::ReadWrite))
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Current state of a task still known to the registry.
    pub fn task_state(
        &self,
        guid: Guid,
    ) -> RuntimeResult<TaskState> {
        Ok(self.resolve_task(guid)?.state())
    }

    /// Payload of a satisfied event, `None` while it has not fired.
    pub fn event_payload(
        &self,
        guid: Guid,
    ) -> RuntimeResult<Option<Guid>> {
        Ok(self.resolve_event(guid)?.payload())
    }

    /// Current count of a latch.
    pub fn latch_count(
        &self,
        guid: Guid,
    ) -> RuntimeResult<i64> {
        Ok(self.resolve_event(guid)?.counter())
    }

    /// Outstanding references on a data object.
    pub fn data_refcount(
        &self,
        guid: Guid,
    ) -> RuntimeResult<u32> {
        Ok(self.resolve_data(guid)?.refcount())
    }
}

/// Construction argument implied by `kind` alone.
fn default_arg(kind: EventKind) -> u32 {
    match kind {
        EventKind::Counted | EventKind::Collective => 1,
        _ => 0,
    }
}
