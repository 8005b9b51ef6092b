//! Guid 区间集成测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use epochrt::runtime::guid::MAX_RANGE_LEN;
use epochrt::runtime::{AccessMode, EventKind, GuidKind, GuidState};
use epochrt::{Guid, RuntimeError};

use crate::common::{counting_template, pool, WAIT};

#[test]
fn test_chain_wired_before_events_exist() {
    let rt = pool(2);
    const LEN: u64 = 10;
    let range = rt.allocate_range(GuidKind::Event, LEN).unwrap();
    let events: Vec<Guid> = (0..LEN).map(|i| rt.guid_from_index(range, i).unwrap()).collect();
    assert_eq!(events[7], rt.guid_from_index(range, 7).unwrap());
    assert!(events.iter().all(|&ev| rt.guid_state(ev) == GuidState::Reserved));

    let relay = rt
        .create_template("relay", |ctx, params, deps| {
            let hops = deps[0].guid();
            let next = Guid::from_raw(params[0]);
            let (out, handle) = ctx.create_data_object(8)?;
            let seen = match ctx.acquire(hops, AccessMode::Const)? {
                Some(input) => input.read_u64(0).unwrap_or(0),
                None => 0,
            };
            // SAFETY: `out` is not shared yet.
            unsafe { handle.write_u64(0, seen + 1) };
            ctx.release(hops)?;
            ctx.satisfy(next, out, 0)?;
            Ok(Guid::NULL)
        })
        .unwrap();
    for pair in events.windows(2) {
        rt.task_builder(relay)
            .params([pair[1].raw()])
            .slots(1)
            .dependencies([pair[0]])
            .dependency_mode(AccessMode::Null)
            .spawn()
            .unwrap();
    }

    // instantiate back to front so every subscription was parked
    for &ev in events.iter().rev() {
        rt.create_event_at(ev, EventKind::Sticky).unwrap();
    }
    let (seed, _) = rt.create_data_object(8).unwrap();
    rt.satisfy(events[0], seed, 0).unwrap();
    assert!(rt.wait_idle_timeout(WAIT));

    let last = rt.event_payload(events[(LEN - 1) as usize]).unwrap().unwrap();
    let handle = rt.acquire(last, Guid::NULL, AccessMode::Const).unwrap().unwrap();
    assert_eq!(handle.read_u64(0), Some(LEN - 1));
}

#[test]
fn test_index_past_end() {
    let rt = pool(1);
    let range = rt.allocate_range(GuidKind::Event, 10).unwrap();
    assert_eq!(
        rt.guid_from_index(range, 10),
        Err(RuntimeError::RangeIndexOutOfBounds {
            range,
            index: 10,
            len: 10,
        })
    );
}

#[test]
fn test_reserved_guid_is_not_yet_usable() {
    let rt = pool(1);
    let range = rt.allocate_range(GuidKind::Event, 2).unwrap();
    let ev = rt.guid_from_index(range, 0).unwrap();
    assert_eq!(rt.satisfy(ev, Guid::NULL, 0), Err(RuntimeError::NotYetPresent(ev)));
    rt.create_event_at(ev, EventKind::Once).unwrap();
    assert_eq!(
        rt.create_event_at(ev, EventKind::Once),
        Err(RuntimeError::AlreadyBound(ev))
    );
    rt.satisfy(ev, Guid::NULL, 0).unwrap();
}

#[test]
fn test_data_object_range_feeds_tasks() {
    let rt = pool(2);
    let runs = Arc::new(AtomicUsize::new(0));
    let t = counting_template(&rt, &runs);
    let range = rt.allocate_range(GuidKind::DataObject, 4).unwrap();
    for i in 0..4 {
        let db = rt.guid_from_index(range, i).unwrap();
        rt.create_data_object_at(db, 16).unwrap();
        rt.task_builder(t)
            .slots(1)
            .dependencies([db])
            .dependency_mode(AccessMode::ReadOnly)
            .spawn()
            .unwrap();
    }
    assert!(rt.wait_idle_timeout(WAIT));
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    for i in 0..4 {
        let db = rt.guid_from_index(range, i).unwrap();
        // only the creator's reference is left
        assert_eq!(rt.data_refcount(db), Ok(1));
    }
}

#[test]
fn test_round_trip_through_index() {
    let rt = pool(1);
    let range = rt.allocate_range(GuidKind::Event, 10).unwrap();
    let ev = rt.guid_from_index(range, 7).unwrap();
    rt.create_event_at(ev, EventKind::Sticky).unwrap();
    let (g, _) = rt.create_data_object(8).unwrap();
    rt.satisfy(ev, g, 0).unwrap();

    let again = rt.guid_from_index(range, 7).unwrap();
    assert_eq!(again, ev);
    assert_eq!(rt.event_payload(again), Ok(Some(g)));
}

#[test]
fn test_huge_range_is_reserved_lazily() {
    let rt = pool(1);
    let before = rt.live_objects();
    let range = rt.allocate_range(GuidKind::Event, MAX_RANGE_LEN).unwrap();
    assert_eq!(rt.live_objects(), before + 1);
    let first = rt.guid_from_index(range, 0).unwrap();
    let last = rt.guid_from_index(range, MAX_RANGE_LEN - 1).unwrap();
    assert_eq!(rt.guid_state(last), GuidState::Reserved);
    rt.create_event_at(last, EventKind::Once).unwrap();
    assert_eq!(rt.guid_state(last), GuidState::Live(GuidKind::Event));

    assert_eq!(
        rt.allocate_range(GuidKind::Event, MAX_RANGE_LEN + 1),
        Err(RuntimeError::RangeTooLarge {
            len: MAX_RANGE_LEN + 1,
            max: MAX_RANGE_LEN,
        })
    );
    rt.destroy(range).unwrap();
    assert_eq!(rt.guid_state(first), GuidState::Destroyed);
    assert_eq!(rt.guid_state(last), GuidState::Live(GuidKind::Event));
}
