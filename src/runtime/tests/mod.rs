//! Runtime 单元测试
//!
//! 内联调度器下的依赖、数据对象、任务生命周期与 finish 作用域

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::runtime::guid::{MAX_RANGE_LEN, MAX_SEQUENCE};
use crate::runtime::{
    AccessMode, Arity, EventKind, Guid, GuidKind, GuidState, ReduceOp, Runtime, SlotCount, TaskProperties,
    TaskState, LATCH_DECR_SLOT, LATCH_INCR_SLOT,
};
use crate::util::config::RuntimeConfig;

fn inline() -> Runtime {
    Runtime::inline().unwrap()
}

/// Template that bumps `counter` and returns null.
fn counting_template(
    rt: &Runtime,
    counter: &Arc<AtomicUsize>,
) -> Guid {
    let counter = counter.clone();
    rt.create_template("count", move |_ctx, _params, _deps| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Guid::NULL)
    })
    .unwrap()
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_node_out_of_range() {
        let config = RuntimeConfig::default().with_node(u16::MAX);
        assert!(matches!(
            Runtime::new(config),
            Err(RuntimeError::UnreachableNode(_))
        ));
    }

    #[test]
    fn test_shutdown_rejects_creation() {
        let rt = inline();
        rt.shutdown();
        assert!(rt.is_shut_down());
        assert_eq!(rt.create_event(EventKind::Sticky), Err(RuntimeError::ShutDown));
        assert_eq!(rt.create_data_object(8).map(|_| ()), Err(RuntimeError::ShutDown));
        // second request is a no-op
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn test_task_requests_shutdown() {
        let rt = inline();
        let stop = rt
            .create_template("stop", |ctx, _, _| {
                ctx.shutdown();
                Ok(Guid::NULL)
            })
            .unwrap();
        rt.task_builder(stop).slots(0).spawn().unwrap();
        rt.wait_for_shutdown();
        assert!(rt.is_shut_down());
        assert_eq!(rt.outstanding_tasks(), 0);
    }

    #[test]
    fn test_wait_idle_timeout_on_blocked_task() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let gate = rt.create_event(EventKind::Once).unwrap();
        rt.task_builder(t).slots(1).dependencies([gate]).spawn().unwrap();
        assert!(!rt.wait_idle_timeout(Duration::from_millis(10)));
        rt.satisfy(gate, Guid::NULL, 0).unwrap();
        assert!(rt.wait_idle_timeout(Duration::from_millis(10)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod dependency_tests {
    use super::*;

    #[test]
    fn test_zero_slot_task_runs_immediately() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        rt.task_builder(t).slots(0).spawn().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(rt.stats().snapshot().tasks_completed, 1);
    }

    #[test]
    fn test_null_dependency_resolves_slot() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let spawned = rt.task_builder(t).slots(2).spawn().unwrap();
        rt.add_dependency(Guid::NULL, spawned.task, 0, AccessMode::Null).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        rt.add_dependency(Guid::NULL, spawned.task, 1, AccessMode::Null).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sticky_delivers_to_late_subscriber() {
        let rt = inline();
        let seen = Arc::new(AtomicU64::new(0));
        let reader = {
            let seen = seen.clone();
            rt.create_template("reader", move |_, _, deps| {
                seen.store(deps[0].guid().raw(), Ordering::SeqCst);
                Ok(Guid::NULL)
            })
            .unwrap()
        };
        let ev = rt.create_event(EventKind::Sticky).unwrap();
        let payload = rt.create_event(EventKind::Once).unwrap();
        rt.satisfy(ev, payload, 0).unwrap();
        rt.task_builder(reader).slots(1).dependencies([ev]).spawn().unwrap();
        assert_eq!(Guid::from_raw(seen.load(Ordering::SeqCst)), payload);
    }

    #[test]
    fn test_slot_wired_twice() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let a = rt.create_event(EventKind::Once).unwrap();
        let b = rt.create_event(EventKind::Once).unwrap();
        let spawned = rt.task_builder(t).slots(1).dependencies([a]).spawn().unwrap();
        assert_eq!(
            rt.add_dependency(b, spawned.task, 0, AccessMode::Null),
            Err(RuntimeError::SlotAlreadyWired {
                task: spawned.task,
                slot: 0
            })
        );
        rt.satisfy(a, Guid::NULL, 0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_wiring_leaves_slot_free() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let dead = rt.create_event(EventKind::Once).unwrap();
        rt.destroy(dead).unwrap();
        let spawned = rt.task_builder(t).slots(1).spawn().unwrap();
        assert_eq!(
            rt.add_dependency(dead, spawned.task, 0, AccessMode::Null),
            Err(RuntimeError::AlreadyDestroyed(dead))
        );
        rt.add_dependency(Guid::NULL, spawned.task, 0, AccessMode::Null).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slot_out_of_range() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let spawned = rt.task_builder(t).slots(1).spawn().unwrap();
        assert!(matches!(
            rt.add_dependency(Guid::NULL, spawned.task, 3, AccessMode::Null),
            Err(RuntimeError::SlotOutOfRange { slot: 3, count: 1, .. })
        ));
    }

    #[test]
    fn test_template_is_not_a_source() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let spawned = rt.task_builder(t).slots(1).spawn().unwrap();
        assert!(matches!(
            rt.add_dependency(t, spawned.task, 0, AccessMode::Null),
            Err(RuntimeError::KindMismatch {
                actual: GuidKind::TaskTemplate,
                ..
            })
        ));
    }

    #[test]
    fn test_event_chain() {
        let rt = inline();
        let head = rt.create_event(EventKind::Once).unwrap();
        let tail = rt.create_event(EventKind::Sticky).unwrap();
        let value = rt.create_event(EventKind::Once).unwrap();
        rt.add_dependency(head, tail, 0, AccessMode::Null).unwrap();
        rt.satisfy(head, value, 0).unwrap();
        assert_eq!(rt.event_payload(tail), Ok(Some(value)));
    }

    #[test]
    fn test_data_dependency_is_acquired_and_released() {
        let rt = inline();
        let (db, handle) = rt.create_data_object(8).unwrap();
        assert_eq!(handle.read_u64(0), Some(0));
        let seen = Arc::new(AtomicU64::new(0));
        let reader = {
            let seen = seen.clone();
            rt.create_template("reader", move |ctx, _, deps| {
                let data = deps[0].data().expect("local data object delivered");
                let refs = ctx.runtime().data_refcount(data.guid())?;
                seen.store(data.read_u64(0).unwrap_or(0) + u64::from(refs), Ordering::SeqCst);
                Ok(Guid::NULL)
            })
            .unwrap()
        };
        // SAFETY: no task holds the object yet.
        assert!(unsafe { handle.write_u64(0, 40) });
        rt.task_builder(reader)
            .slots(1)
            .dependencies([db])
            .dependency_mode(AccessMode::Const)
            .spawn()
            .unwrap();
        // creator + the reader's acquisition
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(rt.data_refcount(db), Ok(1));
    }
}

#[cfg(test)]
mod data_tests {
    use super::*;

    #[test]
    fn test_destroy_waits_for_holders() {
        let rt = inline();
        let (db, _handle) = rt.create_data_object(16).unwrap();
        let holder = Guid::new(GuidKind::Task, 0, 999_999);
        rt.acquire(db, holder, AccessMode::ReadOnly).unwrap();
        rt.destroy(db).unwrap();
        assert_eq!(rt.guid_state(db), GuidState::Live(GuidKind::DataObject));
        assert_eq!(
            rt.acquire(db, Guid::NULL, AccessMode::ReadOnly).map(|_| ()),
            Err(RuntimeError::DestroyPending(db))
        );
        rt.release(db, holder).unwrap();
        assert_eq!(rt.guid_state(db), GuidState::Destroyed);
        assert_eq!(rt.stats().snapshot().data_objects_freed, 1);
        assert_eq!(rt.destroy(db), Err(RuntimeError::AlreadyDestroyed(db)));
    }

    #[test]
    fn test_release_without_acquire() {
        let rt = inline();
        let (db, _) = rt.create_data_object(4).unwrap();
        let stranger = Guid::new(GuidKind::Task, 0, 123_456);
        assert_eq!(
            rt.release(db, stranger),
            Err(RuntimeError::NotAcquired { guid: db, task: stranger })
        );
    }

    #[test]
    fn test_oversized_allocation() {
        let mut config = RuntimeConfig::default();
        config.runtime.max_data_object_bytes = 64;
        let rt = Runtime::new(config).unwrap();
        assert_eq!(
            rt.create_data_object(65).map(|_| ()),
            Err(RuntimeError::AllocationFailed(65))
        );
    }

    #[test]
    fn test_task_created_object_released_on_completion() {
        let rt = inline();
        let made = Arc::new(AtomicU64::new(0));
        let maker = {
            let made = made.clone();
            rt.create_template("maker", move |ctx, _, _| {
                let (db, _) = ctx.create_data_object(32)?;
                made.store(db.raw(), Ordering::SeqCst);
                Ok(db)
            })
            .unwrap()
        };
        let spawned = rt.task_builder(maker).slots(0).with_output_event().spawn().unwrap();
        let db = Guid::from_raw(made.load(Ordering::SeqCst));
        assert_eq!(rt.event_payload(spawned.output_event.unwrap()), Ok(Some(db)));
        assert_eq!(rt.data_refcount(db), Ok(0));
        rt.destroy(db).unwrap();
        assert_eq!(rt.guid_state(db), GuidState::Destroyed);
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_body_error_completes_with_null() {
        let rt = inline();
        let failing = rt
            .create_template("fail", |ctx, _, _| Err(RuntimeError::UnknownGuid(ctx.task())))
            .unwrap();
        let spawned = rt.task_builder(failing).slots(0).with_output_event().spawn().unwrap();
        assert_eq!(rt.event_payload(spawned.output_event.unwrap()), Ok(Some(Guid::NULL)));
        let stats = rt.stats().snapshot();
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[test]
    fn test_panic_is_contained() {
        let rt = inline();
        let boom = rt.create_template("boom", |_, _, _| panic!("boom")).unwrap();
        let spawned = rt.task_builder(boom).slots(0).with_output_event().spawn().unwrap();
        assert_eq!(rt.event_payload(spawned.output_event.unwrap()), Ok(Some(Guid::NULL)));
        assert_eq!(rt.outstanding_tasks(), 0);
    }

    #[test]
    fn test_params_reach_body() {
        let rt = inline();
        let sum = Arc::new(AtomicU64::new(0));
        let adder = {
            let sum = sum.clone();
            rt.create_template_with_arity("add", Arity::Fixed(3), Arity::Fixed(0), move |_, params, _| {
                sum.store(params.iter().sum(), Ordering::SeqCst);
                Ok(Guid::NULL)
            })
            .unwrap()
        };
        rt.task_builder(adder).params([1, 2, 3]).spawn().unwrap();
        assert_eq!(sum.load(Ordering::SeqCst), 6);
        assert!(matches!(
            rt.task_builder(adder).params([1]).spawn(),
            Err(RuntimeError::ArityMismatch { expected: 3, actual: 1, .. })
        ));
    }

    #[test]
    fn test_variadic_needs_slot_count() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        assert_eq!(
            rt.task_builder(t).spawn().map(|s| s.task),
            Err(RuntimeError::UnknownArity(t))
        );
    }

    #[test]
    fn test_destroyed_template() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        rt.destroy(t).unwrap();
        assert_eq!(
            rt.create_task(t, &[], SlotCount::Exactly(0), &[], TaskProperties::Ordinary, false)
                .map(|s| s.task),
            Err(RuntimeError::AlreadyDestroyed(t))
        );
    }

    #[test]
    fn test_destroy_pending_task_cancels_it() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let gate = rt.create_event(EventKind::Once).unwrap();
        let spawned = rt
            .task_builder(t)
            .slots(1)
            .dependencies([gate])
            .with_output_event()
            .spawn()
            .unwrap();
        rt.destroy(spawned.task).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(rt.outstanding_tasks(), 0);
        assert_eq!(rt.event_payload(spawned.output_event.unwrap()), Ok(Some(Guid::NULL)));
        assert_eq!(rt.guid_state(spawned.task), GuidState::Destroyed);
    }

    #[test]
    fn test_retained_task_cannot_be_destroyed() {
        let mut config = RuntimeConfig::default();
        config.runtime.retain_completed_tasks = true;
        let rt = Runtime::new(config).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let spawned = rt.task_builder(t).slots(0).spawn().unwrap();
        assert_eq!(rt.task_state(spawned.task), Ok(TaskState::Completed));
        assert_eq!(
            rt.destroy(spawned.task),
            Err(RuntimeError::TaskAlreadyReleased(spawned.task))
        );
    }
}

#[cfg(test)]
mod finish_tests {
    use super::*;

    #[test]
    fn test_finish_waits_for_children() {
        let rt = inline();
        let children = Arc::new(AtomicUsize::new(0));
        let child = counting_template(&rt, &children);
        let gate = rt.create_event(EventKind::Sticky).unwrap();
        let parent = rt
            .create_template("parent", move |ctx, _, _| {
                for _ in 0..3 {
                    ctx.task_builder(child).slots(1).dependencies([gate]).spawn()?;
                }
                Ok(Guid::NULL)
            })
            .unwrap();

        let spawned = rt.task_builder(parent).slots(0).finish().with_output_event().spawn().unwrap();
        let output = spawned.output_event.unwrap();
        assert_eq!(rt.event_payload(output), Ok(None));

        rt.satisfy(gate, Guid::NULL, 0).unwrap();
        assert_eq!(children.load(Ordering::SeqCst), 3);
        assert_eq!(rt.event_payload(output), Ok(Some(Guid::NULL)));
        assert_eq!(rt.outstanding_tasks(), 0);
    }

    #[test]
    fn test_finish_forwards_return_value() {
        let rt = inline();
        let (value, _) = rt.create_data_object(8).unwrap();
        let body = rt.create_template("value", move |_, _, _| Ok(value)).unwrap();
        let spawned = rt.task_builder(body).slots(0).finish().with_output_event().spawn().unwrap();
        assert_eq!(rt.event_payload(spawned.output_event.unwrap()), Ok(Some(value)));
    }

    #[test]
    fn test_returned_event_chains_output() {
        let rt = inline();
        let later = rt.create_event(EventKind::Once).unwrap();
        let body = rt.create_template("chain", move |_, _, _| Ok(later)).unwrap();
        let spawned = rt.task_builder(body).slots(0).with_output_event().spawn().unwrap();
        let output = spawned.output_event.unwrap();
        assert_eq!(rt.event_payload(output), Ok(None));
        let (db, _) = rt.create_data_object(1).unwrap();
        rt.satisfy(later, db, 0).unwrap();
        assert_eq!(rt.event_payload(output), Ok(Some(db)));
    }

    #[test]
    fn test_explicit_scope_latch() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let latch = rt.create_latch(1).unwrap();
        let gate = rt.create_event(EventKind::Once).unwrap();
        rt.task_builder(t).slots(1).dependencies([gate]).in_scope(latch).spawn().unwrap();
        assert_eq!(rt.latch_count(latch), Ok(2));
        rt.satisfy(latch, Guid::NULL, LATCH_DECR_SLOT).unwrap();
        assert_eq!(rt.event_payload(latch), Ok(None));
        rt.satisfy(gate, Guid::NULL, 0).unwrap();
        assert_eq!(rt.event_payload(latch), Ok(Some(Guid::NULL)));
        assert_eq!(
            rt.satisfy(latch, Guid::NULL, LATCH_INCR_SLOT),
            Err(RuntimeError::LatchClosed(latch))
        );
    }

    #[test]
    fn test_rejected_creation_leaves_latch() {
        let rt = inline();
        let latch = rt.create_latch(1).unwrap();
        let missing = Guid::new(GuidKind::TaskTemplate, 0, 777_777);
        assert!(rt.task_builder(missing).slots(0).in_scope(latch).spawn().is_err());
        assert_eq!(rt.latch_count(latch), Ok(1));
    }

    #[test]
    fn test_failed_wiring_cancels_child() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let latch = rt.create_latch(1).unwrap();
        let gone = rt.create_event(EventKind::Once).unwrap();
        rt.destroy(gone).unwrap();
        let before = rt.live_objects();

        let err = rt
            .task_builder(t)
            .slots(1)
            .dependencies([gone])
            .in_scope(latch)
            .with_output_event()
            .spawn()
            .unwrap_err();
        assert_eq!(err, RuntimeError::AlreadyDestroyed(gone));
        assert_eq!(rt.outstanding_tasks(), 0);
        assert_eq!(rt.latch_count(latch), Ok(1));
        assert_eq!(rt.live_objects(), before);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    /// Burn sequence numbers until exactly `left` remain on this node.
    fn leave_sequences(
        rt: &Runtime,
        left: u64,
    ) {
        let marker = rt.create_event(EventKind::Once).unwrap();
        let mut burn = MAX_SEQUENCE - marker.seq() - left;
        while burn > 0 {
            if burn == 1 {
                rt.create_event(EventKind::Once).unwrap();
                burn = 0;
            } else {
                // a range costs its length plus its own guid
                let len = (burn - 1).min(MAX_RANGE_LEN);
                rt.allocate_range(GuidKind::Event, len).unwrap();
                burn -= len + 1;
            }
        }
    }

    #[test]
    fn test_exhausted_task_guid_rolls_back_scope() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let parent = rt.create_latch(1).unwrap();
        // room for the output event, the scope latch and the continuation
        leave_sequences(&rt, 3);
        let before = rt.live_objects();

        let err = rt
            .task_builder(t)
            .slots(0)
            .finish()
            .with_output_event()
            .in_scope(parent)
            .spawn()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::GuidExhausted(_)));
        assert_eq!(rt.live_objects(), before);
        assert_eq!(rt.outstanding_tasks(), 0);
        assert_eq!(rt.latch_count(parent), Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exhausted_continuation_rolls_back_scope() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let parent = rt.create_latch(1).unwrap();
        leave_sequences(&rt, 2);
        let before = rt.live_objects();

        let err = rt
            .task_builder(t)
            .slots(0)
            .finish()
            .with_output_event()
            .in_scope(parent)
            .spawn()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::GuidExhausted(_)));
        assert_eq!(rt.live_objects(), before);
        assert_eq!(rt.outstanding_tasks(), 0);
        assert_eq!(rt.latch_count(parent), Ok(1));
    }
}

#[cfg(test)]
mod range_tests {
    use super::*;

    #[test]
    fn test_subscribe_before_instantiation() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let range = rt.allocate_range(GuidKind::Event, 4).unwrap();
        let ev = rt.guid_from_index(range, 2).unwrap();
        assert_eq!(rt.guid_state(ev), GuidState::Reserved);

        rt.task_builder(t).slots(1).dependencies([ev]).spawn().unwrap();
        rt.create_event_at(ev, EventKind::Once).unwrap();
        rt.satisfy(ev, Guid::NULL, 0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_range_kind_restricted() {
        let rt = inline();
        assert!(matches!(
            rt.allocate_range(GuidKind::Task, 2),
            Err(RuntimeError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_destroy_range_drops_reserved() {
        let rt = inline();
        let range = rt.allocate_range(GuidKind::DataObject, 3).unwrap();
        let bound = rt.guid_from_index(range, 0).unwrap();
        let spare = rt.guid_from_index(range, 1).unwrap();
        rt.create_data_object_at(bound, 8).unwrap();
        rt.destroy(range).unwrap();
        assert_eq!(rt.guid_state(bound), GuidState::Live(GuidKind::DataObject));
        assert_eq!(rt.guid_state(spare), GuidState::Destroyed);
        assert!(matches!(rt.guid_from_index(range, 0), Err(RuntimeError::AlreadyDestroyed(_))));
    }
}

#[cfg(test)]
mod channel_tests {
    use super::*;

    /// Template storing the payload it received in slot 0.
    fn recording_template(
        rt: &Runtime,
        log: &Arc<parking_lot::Mutex<Vec<Guid>>>,
    ) -> Guid {
        let log = log.clone();
        rt.create_template("record", move |_, _, deps| {
            log.lock().push(deps[0].guid());
            Ok(Guid::NULL)
        })
        .unwrap()
    }

    #[test]
    fn test_channel_matches_in_fifo_order() {
        let rt = inline();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let t = recording_template(&rt, &log);
        let channel = rt.create_event(EventKind::Channel).unwrap();
        let payloads: Vec<Guid> = (0..4).map(|_| rt.create_data_object(8).unwrap().0).collect();

        // two producers ahead of any consumer
        rt.satisfy(channel, payloads[0], 0).unwrap();
        rt.satisfy(channel, payloads[1], 0).unwrap();
        for _ in 0..4 {
            rt.task_builder(t)
                .slots(1)
                .dependencies([channel])
                .dependency_mode(AccessMode::Null)
                .spawn()
                .unwrap();
        }
        assert_eq!(*log.lock(), payloads[..2]);
        // two consumers ahead of the remaining producers
        rt.satisfy(channel, payloads[2], 0).unwrap();
        rt.satisfy(channel, payloads[3], 0).unwrap();
        assert_eq!(*log.lock(), payloads);
        assert_eq!(rt.outstanding_tasks(), 0);
        assert_eq!(rt.event_payload(channel), Ok(None));
    }

    #[test]
    fn test_unmatched_satisfy_waits_for_consumer() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let channel = rt.create_event(EventKind::Channel).unwrap();
        rt.satisfy(channel, Guid::NULL, 0).unwrap();
        rt.satisfy(channel, Guid::NULL, 0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        rt.task_builder(t).slots(1).dependencies([channel]).spawn().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        rt.task_builder(t).slots(1).dependencies([channel]).spawn().unwrap();
        rt.task_builder(t).slots(1).dependencies([channel]).spawn().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(rt.outstanding_tasks(), 1);
    }
}

#[cfg(test)]
mod collective_tests {
    use super::*;

    fn contribution(
        rt: &Runtime,
        value: f64,
    ) -> Guid {
        let (guid, handle) = rt.create_data_object(8).unwrap();
        // SAFETY: not shared yet.
        unsafe { handle.write_u64(0, value.to_bits()) };
        guid
    }

    fn result_of(
        rt: &Runtime,
        payload: Guid,
    ) -> f64 {
        let handle = rt.acquire(payload, Guid::NULL, AccessMode::Const).unwrap().unwrap();
        let value = f64::from_bits(handle.read_u64(0).unwrap());
        rt.release(payload, Guid::NULL).unwrap();
        value
    }

    #[test]
    fn test_reduces_once_every_contributor_arrived() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let sum = rt.create_collective(3, ReduceOp::Add).unwrap();
        rt.task_builder(t).slots(1).dependencies([sum]).spawn().unwrap();

        rt.satisfy(sum, contribution(&rt, 1.5), 0).unwrap();
        rt.satisfy(sum, contribution(&rt, 2.0), 2).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(rt.event_payload(sum), Ok(None));
        rt.satisfy(sum, contribution(&rt, 4.0), 1).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let result = rt.event_payload(sum).unwrap().unwrap();
        assert_eq!(result_of(&rt, result), 7.5);
    }

    #[test]
    fn test_rounds_restart_after_reduction() {
        let rt = inline();
        let max = rt.create_collective(2, ReduceOp::Max).unwrap();
        rt.satisfy(max, contribution(&rt, 3.0), 0).unwrap();
        rt.satisfy(max, contribution(&rt, -1.0), 1).unwrap();
        let first = rt.event_payload(max).unwrap().unwrap();
        assert_eq!(result_of(&rt, first), 3.0);

        // null contributions are skipped
        rt.satisfy(max, Guid::NULL, 0).unwrap();
        rt.satisfy(max, contribution(&rt, -8.0), 1).unwrap();
        let second = rt.event_payload(max).unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(result_of(&rt, second), -8.0);
    }

    #[test]
    fn test_contributor_counted_once_per_round() {
        let rt = inline();
        let mul = rt.create_collective(2, ReduceOp::Mul).unwrap();
        rt.satisfy(mul, contribution(&rt, 2.0), 0).unwrap();
        assert_eq!(
            rt.satisfy(mul, contribution(&rt, 2.0), 0),
            Err(RuntimeError::DuplicateSatisfaction(mul))
        );
        assert!(matches!(
            rt.satisfy(mul, Guid::NULL, 2),
            Err(RuntimeError::SlotOutOfRange { slot: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_all_null_round_delivers_null() {
        let rt = inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let t = counting_template(&rt, &counter);
        let ev = rt.create_event(EventKind::Collective).unwrap();
        rt.task_builder(t).slots(1).dependencies([ev]).spawn().unwrap();
        rt.satisfy(ev, Guid::NULL, 0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(rt.event_payload(ev), Ok(Some(Guid::NULL)));
    }
}
