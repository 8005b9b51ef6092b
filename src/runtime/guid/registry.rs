//! Sharded Guid registry
//!
//! Unrelated task graphs must not serialize on one lock, so entries are spread
//! over independently locked shards. A lookup clones the object's `Arc` and
//! drops the shard guard before the caller touches the object; per-object
//! state lives in the object's own atomics and locks.
//!
//! Reserved ranges are kept apart from the shards as one record per range,
//! keyed by base sequence. A record only grows when one of its indices is
//! bound or subscribed to, so reserving a range costs the same whatever its
//! length. Lock order is ranges before shard; binding inserts into the shard
//! while holding the ranges lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Guid, GuidKind, GuidRange, MAX_RANGE_LEN, MAX_SEQUENCE};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::datablock::DataObject;
use crate::runtime::event::{Event, Waiter};
use crate::runtime::task::{Task, Template};

/// A live runtime object.
#[derive(Clone)]
pub enum Object {
    Template(Arc<Template>),
    Task(Arc<Task>),
    Event(Arc<Event>),
    DataObject(Arc<DataObject>),
    Range(Arc<GuidRange>),
}

impl Object {
    pub fn kind(&self) -> GuidKind {
        match self {
            Object::Template(_) => GuidKind::TaskTemplate,
            Object::Task(_) => GuidKind::Task,
            Object::Event(_) => GuidKind::Event,
            Object::DataObject(_) => GuidKind::DataObject,
            Object::Range(_) => GuidKind::GuidRange,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Object::Template(t) => t.fmt(f),
            Object::Task(t) => t.fmt(f),
            Object::Event(e) => e.fmt(f),
            Object::DataObject(d) => d.fmt(f),
            Object::Range(r) => r.fmt(f),
        }
    }
}

/// What the registry knows about a Guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidState {
    Live(GuidKind),
    /// Allocated by a range, no object installed yet.
    Reserved,
    Destroyed,
    /// Never handed out by this node.
    Unknown,
}

/// One reserved range. Only indices that were bound or subscribed to are
/// recorded.
struct Reservation {
    kind: GuidKind,
    len: u64,
    /// Indices that received an object, whether or not it is still alive.
    bound: HashSet<u64>,
    /// Subscriptions waiting for an index to be bound.
    parked: HashMap<u64, Vec<Waiter>>,
}

type Reservations = BTreeMap<u64, Reservation>;

fn reservation_of(
    ranges: &Reservations,
    seq: u64,
) -> Option<&Reservation> {
    ranges
        .range(..=seq)
        .next_back()
        .filter(|(base, reservation)| seq - **base < reservation.len)
        .map(|(_, reservation)| reservation)
}

fn reservation_of_mut(
    ranges: &mut Reservations,
    seq: u64,
) -> Option<&mut Reservation> {
    ranges
        .range_mut(..=seq)
        .next_back()
        .filter(|(base, reservation)| seq - **base < reservation.len)
        .map(|(_, reservation)| reservation)
}

/// Outcome of a deferred subscription attempt.
pub(crate) enum Subscription {
    /// The waiter was parked on a reserved slot.
    Deferred,
    /// The Guid is already bound; subscribe on the object itself.
    Live(Object),
}

/// Process-wide map from Guid to runtime object for one node.
pub struct Registry {
    node: u16,
    next_seq: AtomicU64,
    shards: Box<[RwLock<HashMap<u64, Object>>]>,
    ranges: RwLock<Reservations>,
}

impl fmt::Debug for Registry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Registry")
            .field("node", &self.node)
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .field("shards", &self.shards.len())
            .field("ranges", &self.ranges.read().len())
            .finish()
    }
}

impl Registry {
    /// Create a registry for `node` with `shards` independently locked maps.
    pub fn new(
        node: u16,
        shards: usize,
    ) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            node,
            next_seq: AtomicU64::new(1),
            shards,
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn node(&self) -> u16 {
        self.node
    }

    /// Whether this registry owns `guid`.
    #[inline]
    pub fn is_local(
        &self,
        guid: Guid,
    ) -> bool {
        guid.node() == self.node
    }

    #[inline]
    fn shard(
        &self,
        seq: u64,
    ) -> &RwLock<HashMap<u64, Object>> {
        &self.shards[(seq % self.shards.len() as u64) as usize]
    }

    fn allocate(
        &self,
        count: u64,
    ) -> RuntimeResult<u64> {
        self.next_seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count)
                    .filter(|end| *end <= MAX_SEQUENCE + 1)
            })
            .map_err(|_| RuntimeError::GuidExhausted(self.node))
    }

    fn missing(
        &self,
        guid: Guid,
    ) -> RuntimeError {
        if guid.is_null() || !self.is_local(guid) {
            return RuntimeError::UnknownGuid(guid);
        }
        if guid.seq() != 0 && guid.seq() < self.next_seq.load(Ordering::Acquire) {
            RuntimeError::AlreadyDestroyed(guid)
        } else {
            RuntimeError::UnknownGuid(guid)
        }
    }

    /// Why `guid` has no object, given the current reservations.
    fn absent(
        &self,
        ranges: &Reservations,
        guid: Guid,
    ) -> RuntimeError {
        if self.is_local(guid) {
            if let Some(reservation) = reservation_of(ranges, guid.seq()) {
                if reservation.kind != guid.kind() {
                    return RuntimeError::UnknownGuid(guid);
                }
                if !reservation.bound.contains(&guid.seq()) {
                    return RuntimeError::NotYetPresent(guid);
                }
            }
        }
        self.missing(guid)
    }

    /// Shard lookup; `None` when the shard has no entry.
    fn lookup(
        &self,
        guid: Guid,
    ) -> Option<RuntimeResult<Object>> {
        let shard = self.shard(guid.seq()).read();
        shard.get(&guid.seq()).map(|object| {
            if object.kind() == guid.kind() && self.is_local(guid) {
                Ok(object.clone())
            } else {
                Err(RuntimeError::UnknownGuid(guid))
            }
        })
    }

    /// Allocate a Guid of `kind` and install the object built for it.
    pub fn create(
        &self,
        kind: GuidKind,
        build: impl FnOnce(Guid) -> RuntimeResult<Object>,
    ) -> RuntimeResult<(Guid, Object)> {
        let seq = self.allocate(1)?;
        let guid = Guid::new(kind, self.node, seq);
        let object = build(guid)?;
        debug_assert_eq!(object.kind(), kind);
        self.shard(seq).write().insert(seq, object.clone());
        debug!(%guid, "created");
        Ok((guid, object))
    }

    /// Reserve `len` contiguous Guids of `kind` without materializing objects.
    pub fn reserve_range(
        &self,
        kind: GuidKind,
        len: u64,
    ) -> RuntimeResult<Arc<GuidRange>> {
        if len > MAX_RANGE_LEN {
            return Err(RuntimeError::RangeTooLarge {
                len,
                max: MAX_RANGE_LEN,
            });
        }
        let base = self.allocate(len)?;
        self.ranges.write().insert(
            base,
            Reservation {
                kind,
                len,
                bound: HashSet::new(),
                parked: HashMap::new(),
            },
        );
        let created = self.create(GuidKind::GuidRange, |guid| {
            Ok(Object::Range(Arc::new(GuidRange::new(guid, kind, base, len))))
        });
        match created {
            Ok((_, Object::Range(range))) => Ok(range),
            Ok(_) => unreachable!("range guid bound to another kind"),
            Err(e) => {
                self.ranges.write().remove(&base);
                Err(e)
            }
        }
    }

    /// Install `object` at a reserved Guid, returning the waiters parked on it.
    pub fn bind(
        &self,
        guid: Guid,
        object: Object,
    ) -> RuntimeResult<Vec<Waiter>> {
        if guid.kind() != object.kind() {
            return Err(RuntimeError::KindMismatch {
                guid,
                expected: guid.kind(),
                actual: object.kind(),
            });
        }
        if !self.is_local(guid) {
            return Err(RuntimeError::UnknownGuid(guid));
        }
        let seq = guid.seq();
        let mut ranges = self.ranges.write();
        let live = self.shard(seq).read().contains_key(&seq);
        let Some(reservation) = reservation_of_mut(&mut ranges, seq) else {
            return Err(if live {
                RuntimeError::AlreadyBound(guid)
            } else {
                self.missing(guid)
            });
        };
        if reservation.kind != guid.kind() {
            return Err(RuntimeError::UnknownGuid(guid));
        }
        if !reservation.bound.insert(seq) {
            return Err(if live {
                RuntimeError::AlreadyBound(guid)
            } else {
                RuntimeError::AlreadyDestroyed(guid)
            });
        }
        let pending = reservation.parked.remove(&seq).unwrap_or_default();
        self.shard(seq).write().insert(seq, object);
        debug!(%guid, parked = pending.len(), "bound reserved guid");
        Ok(pending)
    }

    /// Look up the live object named by `guid`.
    pub fn resolve(
        &self,
        guid: Guid,
    ) -> RuntimeResult<Object> {
        if let Some(found) = self.lookup(guid) {
            return found;
        }
        let ranges = self.ranges.read();
        // a concurrent bind has either finished or not started
        if let Some(found) = self.lookup(guid) {
            return found;
        }
        Err(self.absent(&ranges, guid))
    }

    /// Park `waiter` on a reserved Guid, or hand back the live object.
    pub(crate) fn subscribe(
        &self,
        guid: Guid,
        waiter: Waiter,
    ) -> RuntimeResult<Subscription> {
        if let Some(found) = self.lookup(guid) {
            return found.map(Subscription::Live);
        }
        let mut ranges = self.ranges.write();
        if let Some(found) = self.lookup(guid) {
            return found.map(Subscription::Live);
        }
        if self.is_local(guid) {
            if let Some(reservation) = reservation_of_mut(&mut ranges, guid.seq()) {
                if reservation.kind == guid.kind() && !reservation.bound.contains(&guid.seq()) {
                    reservation.parked.entry(guid.seq()).or_default().push(waiter);
                    return Ok(Subscription::Deferred);
                }
            }
        }
        Err(self.absent(&ranges, guid))
    }

    fn take(
        &self,
        guid: Guid,
    ) -> Option<RuntimeResult<Object>> {
        let mut shard = self.shard(guid.seq()).write();
        match shard.get(&guid.seq()) {
            Some(object) if object.kind() == guid.kind() && self.is_local(guid) => {}
            Some(_) => return Some(Err(RuntimeError::UnknownGuid(guid))),
            None => return None,
        }
        shard.remove(&guid.seq()).map(Ok)
    }

    /// Remove the mapping for `guid`.
    ///
    /// Removing a Guid twice reports [`RuntimeError::AlreadyDestroyed`] every
    /// time; a reserved slot reports [`RuntimeError::NotYetPresent`].
    pub fn remove(
        &self,
        guid: Guid,
    ) -> RuntimeResult<Object> {
        let removed = match self.take(guid) {
            Some(removed) => removed,
            None => {
                let ranges = self.ranges.read();
                match self.take(guid) {
                    Some(removed) => removed,
                    None => Err(self.absent(&ranges, guid)),
                }
            }
        };
        if removed.is_ok() {
            debug!(%guid, "destroyed");
        }
        removed
    }

    /// Drop the reservation behind `range`, returning how many of its slots
    /// were never bound. Bound slots are left alone; waiters parked on the
    /// rest are dropped.
    pub(crate) fn release_reserved(
        &self,
        range: &GuidRange,
    ) -> u64 {
        self.ranges
            .write()
            .remove(&range.base())
            .map_or(0, |reservation| reservation.len - reservation.bound.len() as u64)
    }

    /// Classify `guid` without touching the object.
    pub fn state(
        &self,
        guid: Guid,
    ) -> GuidState {
        if !self.is_local(guid) {
            return GuidState::Unknown;
        }
        let found = match self.lookup(guid) {
            Some(found) => Ok(found),
            None => {
                let ranges = self.ranges.read();
                self.lookup(guid).ok_or_else(|| self.absent(&ranges, guid))
            }
        };
        match found {
            Ok(Ok(object)) => GuidState::Live(object.kind()),
            Ok(Err(_)) => GuidState::Unknown,
            Err(RuntimeError::NotYetPresent(_)) => GuidState::Reserved,
            Err(RuntimeError::AlreadyDestroyed(_)) => GuidState::Destroyed,
            Err(_) => GuidState::Unknown,
        }
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Number of ranges whose reservation is still held.
    pub fn reserved_ranges(&self) -> usize {
        self.ranges.read().len()
    }
}
