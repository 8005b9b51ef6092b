//! Dependency-slot engine
//!
//! Wires sources (events, data objects, or the null "no value" signal) to
//! destination slots, runs event fan-out outside any lock, and hands tasks
//! whose last slot resolved to the scheduler. Every operation whose target
//! lives on another node is shipped over the comm boundary instead.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::comm::{Operation, RemoteMessage};
use crate::runtime::datablock::{AccessMode, DataHandle, DataObject};
use crate::runtime::event::{Event, EventKind, Fanout, Reduced, Registration, Waiter};
use crate::runtime::guid::{Guid, GuidKind, Object, Subscription};
use crate::runtime::scheduler::ReadyTask;
use crate::runtime::stats::RuntimeStats;
use crate::runtime::task::{Dependency, Task, Template};
use crate::runtime::Runtime;

/// How a slot resolution treats its slot claim and acquisition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Direct `add_dependency`: claim the slot, undo everything on failure.
    Strict,
    /// Event fan-out: the slot was claimed at subscription time and must be
    /// resolved even when acquiring the payload fails.
    Lenient,
}

macro_rules! resolve_as {
    ($name:ident, $kind:ident, $variant:ident, $ty:ty) => {
        pub(crate) fn $name(
            &self,
            guid: Guid,
        ) -> RuntimeResult<Arc<$ty>> {
            guid.expect_kind(GuidKind::$kind)?;
            match self.registry().resolve(guid)? {
                Object::$variant(object) => Ok(object),
                other => Err(RuntimeError::KindMismatch {
                    guid,
                    expected: GuidKind::$kind,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl Runtime {
    resolve_as!(resolve_template, TaskTemplate, Template, Template);
    resolve_as!(resolve_task, Task, Task, Task);
    resolve_as!(resolve_event, Event, Event, Event);
    resolve_as!(resolve_data, DataObject, DataObject, DataObject);

    #[inline]
    pub(crate) fn is_local(
        &self,
        guid: Guid,
    ) -> bool {
        self.registry().is_local(guid)
    }

    /// Wire `source` to slot `slot` of `dest`.
    ///
    /// `source` is an event (the slot resolves when it fires), a data object
    /// (acquired under `mode` and resolved now) or [`Guid::NULL`] (resolved now
    /// with no value). `dest` is a task, or an event to chain.
    pub fn add_dependency(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> RuntimeResult<()> {
        match dest.kind() {
            GuidKind::Task | GuidKind::Event => {}
            actual => {
                return Err(RuntimeError::KindMismatch {
                    guid: dest,
                    expected: GuidKind::Task,
                    actual,
                })
            }
        }

        match source.kind() {
            GuidKind::None if source.is_null() => self.signal(dest, slot, Guid::NULL, mode, Delivery::Strict),
            GuidKind::DataObject => self.signal(dest, slot, source, mode, Delivery::Strict),
            GuidKind::Event => {
                let claimed = self.claim_slot(dest, slot)?;
                let waiter = Waiter { dest, slot, mode };
                let result = if self.is_local(source) {
                    self.subscribe(source, waiter)
                } else {
                    let message = RemoteMessage::new(Operation::AddDependency, self.node(), dest)
                        .with_payload(source)
                        .with_slot(slot)
                        .with_mode(mode);
                    self.send_remote(source.node(), message)
                };
                if result.is_err() {
                    if let Some(task) = claimed {
                        task.unwire(slot);
                    }
                }
                result
            }
            actual => Err(RuntimeError::KindMismatch {
                guid: source,
                expected: GuidKind::Event,
                actual,
            }),
        }
    }

    /// Validate `slot` of a local destination and, for tasks, claim it.
    fn claim_slot(
        &self,
        dest: Guid,
        slot: u32,
    ) -> RuntimeResult<Option<Arc<Task>>> {
        if !self.is_local(dest) {
            return Ok(None);
        }
        match dest.kind() {
            GuidKind::Task => {
                let task = self.resolve_task(dest)?;
                task.wire(slot)?;
                Ok(Some(task))
            }
            _ => {
                let event = self.resolve_event(dest)?;
                if slot >= event.slot_count() {
                    return Err(RuntimeError::SlotOutOfRange {
                        guid: dest,
                        slot,
                        count: event.slot_count(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Register `waiter` on local event `source`, delivering at once if it
    /// already fired.
    fn subscribe(
        &self,
        source: Guid,
        waiter: Waiter,
    ) -> RuntimeResult<()> {
        let event = match self.registry().subscribe(source, waiter)? {
            Subscription::Deferred => {
                trace!(%source, dest = %waiter.dest, "subscription parked on reserved guid");
                return Ok(());
            }
            Subscription::Live(Object::Event(event)) => event,
            Subscription::Live(other) => {
                return Err(RuntimeError::KindMismatch {
                    guid: source,
                    expected: GuidKind::Event,
                    actual: other.kind(),
                })
            }
        };
        self.register_waiter(&event, waiter)
    }

    pub(crate) fn register_waiter(
        &self,
        event: &Event,
        waiter: Waiter,
    ) -> RuntimeResult<()> {
        match event.register(waiter)? {
            Registration::Parked => Ok(()),
            Registration::Deliver { payload, retire } => {
                let delivered = self.signal(waiter.dest, waiter.slot, payload, waiter.mode, Delivery::Lenient);
                if retire {
                    self.retire_event(event.guid());
                }
                delivered
            }
        }
    }

    /// Resolve slot `slot` of `dest` with `payload`.
    pub(crate) fn signal(
        &self,
        dest: Guid,
        slot: u32,
        payload: Guid,
        mode: AccessMode,
        delivery: Delivery,
    ) -> RuntimeResult<()> {
        if !self.is_local(dest) {
            let message = RemoteMessage::new(Operation::Signal, self.node(), dest)
                .with_payload(payload)
                .with_slot(slot)
                .with_mode(mode);
            return self.send_remote(dest.node(), message);
        }
        match dest.kind() {
            GuidKind::Task => {
                let task = self.resolve_task(dest)?;
                self.signal_task(&task, slot, payload, mode, delivery)
            }
            GuidKind::Event => self.satisfy(dest, payload, slot),
            actual => Err(RuntimeError::KindMismatch {
                guid: dest,
                expected: GuidKind::Task,
                actual,
            }),
        }
    }

    fn signal_task(
        &self,
        task: &Arc<Task>,
        slot: u32,
        payload: Guid,
        mode: AccessMode,
        delivery: Delivery,
    ) -> RuntimeResult<()> {
        if delivery == Delivery::Strict {
            task.wire(slot)?;
        }

        let mut failure = None;
        let data = match self.acquire_for(task, payload, mode) {
            Ok(data) => data,
            Err(e) if delivery == Delivery::Strict => {
                task.unwire(slot);
                return Err(e);
            }
            Err(e) => {
                warn!(task = %task.guid(), slot, %payload, error = %e, "slot resolved without its data object");
                failure = Some(e);
                None
            }
        };
        let acquired = data.is_some() || (payload.kind() == GuidKind::DataObject && !self.is_local(payload));

        match task.resolve_slot(slot, Dependency::new(payload, mode, data)) {
            Ok(released) => {
                debug!(task = %task.guid(), slot, %payload, "slot resolved");
                if released {
                    self.release_ready(task.clone());
                }
            }
            Err(e) => {
                if acquired && failure.is_none() && task.forget_held(payload) {
                    let _ = self.release_data(payload, task.guid());
                }
                return Err(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Acquire `payload` for `task` if it is a data object and `mode` wants access.
    fn acquire_for(
        &self,
        task: &Task,
        payload: Guid,
        mode: AccessMode,
    ) -> RuntimeResult<Option<DataHandle>> {
        if payload.kind() != GuidKind::DataObject || mode == AccessMode::Null {
            return Ok(None);
        }
        if !self.is_local(payload) {
            let message = RemoteMessage::new(Operation::Acquire, self.node(), payload)
                .with_requester(task.guid())
                .with_mode(mode);
            self.send_remote(payload.node(), message)?;
            task.note_held(payload);
            return Ok(None);
        }
        let object: Arc<DataObject> = self.resolve_data(payload)?;
        object.acquire(task.guid(), mode)?;
        task.note_held(payload);
        Ok(Some(DataHandle::new(object, mode)))
    }

    /// Satisfy `event` with `payload` on `slot`.
    ///
    /// When this call fires the event, its payload is delivered to every
    /// subscriber before returning; the first delivery failure is reported,
    /// but the event stays satisfied.
    pub fn satisfy(
        &self,
        event: Guid,
        payload: Guid,
        slot: u32,
    ) -> RuntimeResult<()> {
        if !self.is_local(event) {
            event.expect_kind(GuidKind::Event)?;
            let message = RemoteMessage::new(Operation::Satisfy, self.node(), event)
                .with_payload(payload)
                .with_slot(slot);
            return self.send_remote(event.node(), message);
        }
        let object = self.resolve_event(event)?;
        if object.kind() == EventKind::Collective {
            let value = self.contribution(payload)?;
            return match object.contribute(slot, value)? {
                Some(reduced) => self.publish_round(&object, reduced),
                None => Ok(()),
            };
        }
        match object.satisfy(payload, slot)? {
            Some(fanout) => self.fan_out(event, fanout),
            None => Ok(()),
        }
    }

    /// Value carried by a collective contribution: the first `f64` of a local
    /// data object, or nothing for null.
    fn contribution(
        &self,
        payload: Guid,
    ) -> RuntimeResult<Option<f64>> {
        if payload.is_null() {
            return Ok(None);
        }
        payload.expect_kind(GuidKind::DataObject)?;
        let object = self.resolve_data(payload)?;
        let handle = DataHandle::new(object, AccessMode::Const);
        Ok(handle.read_u64(0).map(f64::from_bits))
    }

    /// Store a finished round's result in a fresh data object and deliver it
    /// to the round's subscribers.
    fn publish_round(
        &self,
        event: &Event,
        reduced: Reduced,
    ) -> RuntimeResult<()> {
        let payload = match reduced.value {
            Some(value) => {
                let (guid, handle) = self.create_data_object(8)?;
                // SAFETY: the object is not shared yet.
                unsafe { handle.write_u64(0, value.to_bits()) };
                guid
            }
            None => Guid::NULL,
        };
        event.record_result(payload);
        debug!(event = %event.guid(), generation = reduced.generation, value = ?reduced.value, "collective round reduced");
        self.fan_out(
            event.guid(),
            Fanout {
                payload,
                waiters: reduced.waiters,
                retire: false,
            },
        )
    }

    fn fan_out(
        &self,
        event: Guid,
        fanout: Fanout,
    ) -> RuntimeResult<()> {
        RuntimeStats::bump(&self.stats().events_satisfied);
        debug!(%event, payload = %fanout.payload, waiters = fanout.waiters.len(), "event fired");
        let mut first_error = None;
        for waiter in fanout.waiters {
            trace!(%event, dest = %waiter.dest, slot = waiter.slot, "deliver");
            if let Err(e) = self.signal(waiter.dest, waiter.slot, fanout.payload, waiter.mode, Delivery::Lenient) {
                warn!(%event, dest = %waiter.dest, slot = waiter.slot, error = %e, "delivery failed");
                first_error.get_or_insert(e);
            }
        }
        if fanout.retire {
            self.retire_event(event);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn retire_event(
        &self,
        event: Guid,
    ) {
        if self.registry().remove(event).is_ok() {
            debug!(%event, "event retired");
        }
    }

    /// Forward a task's result into `dest`, falling back to a null signal when
    /// the value cannot be wired (so scopes and consumers never hang).
    pub(crate) fn forward_result(
        &self,
        value: Guid,
        dest: Guid,
        slot: u32,
    ) {
        let Err(e) = self.add_dependency(value, dest, slot, AccessMode::Null) else {
            return;
        };
        warn!(%value, %dest, error = %e, "task result not forwardable, sending null");
        if let Err(e) = self.add_dependency(Guid::NULL, dest, slot, AccessMode::Null) {
            warn!(%dest, error = %e, "null forward failed");
        }
    }

    /// Hand a task whose slots are all resolved to the scheduler.
    pub(crate) fn release_ready(
        &self,
        task: Arc<Task>,
    ) {
        let runtime = self.clone();
        let guid = task.guid();
        trace!(task = %guid, "released to scheduler");
        self.scheduler()
            .release_ready(ReadyTask::new(guid, move || runtime.execute(task)));
    }
}
