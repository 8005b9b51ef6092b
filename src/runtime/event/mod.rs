//! Events
//!
//! An event is a one-shot (or, for latches, counting) synchronization object
//! that fans its payload out to the `(destination, slot)` pairs subscribed to
//! it. The event itself only decides *who* gets *what*; actually resolving the
//! destination slots is done by the dependency engine after the event's lock
//! has been dropped, so fan-out never runs under a lock.
//!
//! # State machine
//!
//! ```text
//! Once / Sticky / Idem / Counted:   Open ──satisfy──▶ Fired        (terminal)
//! Latch:                            Open(n) ──decr to 0──▶ Fired   (terminal)
//! Channel / Collective:             Open, one generation per match
//! ```
//!
//! For the single-shot kinds the subscriber list is append-only while `Open`
//! and is drained exactly once by the transition to `Fired`.
//!
//! A channel never fires as a whole. Each satisfy is matched with exactly one
//! subscription in FIFO order, whichever side arrives first: payloads wait in
//! a queue for consumers, consumers wait in the subscriber list for payloads.
//!
//! A collective event gathers one contribution per slot, reduces them with its
//! [`ReduceOp`] once every slot has contributed, hands the result to the
//! subscribers registered during that generation and starts the next one.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::datablock::AccessMode;
use crate::runtime::guid::Guid;

/// Latch slot that decrements the counter.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Latch slot that increments the counter.
pub const LATCH_INCR_SLOT: u32 = 1;

/// Event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Single payload, delivered to every current and future subscriber.
    Once,
    /// Like `Sticky`, but a repeated satisfy with the same payload is a no-op.
    Idem,
    /// Single payload; a second satisfy is rejected.
    Sticky,
    /// Signed counter; fires when a decrement brings it to zero.
    Latch,
    /// Sticky event retired after a known number of subscribers were served.
    Counted,
    /// Reusable FIFO: every satisfy feeds exactly one subscriber.
    Channel,
    /// Reduction over a fixed number of contributors, one result per round.
    Collective,
}

/// Reduction applied by a collective event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReduceOp {
    #[default]
    Add,
    Mul,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply(
        self,
        a: f64,
        b: f64,
    ) -> f64 {
        match self {
            ReduceOp::Add => a + b,
            ReduceOp::Mul => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            EventKind::Once => "once",
            EventKind::Idem => "idem",
            EventKind::Sticky => "sticky",
            EventKind::Latch => "latch",
            EventKind::Counted => "counted",
            EventKind::Channel => "channel",
            EventKind::Collective => "collective",
        };
        f.write_str(name)
    }
}

/// A subscription: deliver the payload to `slot` of `dest` under `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub dest: Guid,
    pub slot: u32,
    pub mode: AccessMode,
}

/// Deliveries produced by the transition to `Fired`.
#[derive(Debug)]
pub(crate) struct Fanout {
    pub payload: Guid,
    pub waiters: SmallVec<[Waiter; 4]>,
    /// The event should be removed from the registry once delivered.
    pub retire: bool,
}

/// A finished collective round.
#[derive(Debug)]
pub(crate) struct Reduced {
    /// `None` when every contributor sent null.
    pub value: Option<f64>,
    pub generation: u64,
    pub waiters: SmallVec<[Waiter; 4]>,
}

/// Outcome of a subscription.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    Parked,
    /// Already fired: deliver this payload to the new subscriber now.
    Deliver { payload: Guid, retire: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Fired,
}

#[derive(Debug)]
struct EventState {
    phase: Phase,
    payload: Guid,
    waiters: SmallVec<[Waiter; 4]>,
    counter: i64,
    subscribers: u32,
    /// Channel payloads not yet matched with a subscriber.
    queued: VecDeque<Guid>,
    round: Option<Round>,
}

/// Contributions of the current collective generation.
#[derive(Debug)]
struct Round {
    op: ReduceOp,
    values: Vec<Option<f64>>,
    arrived: Vec<bool>,
    count: u32,
    generation: u64,
}

impl Round {
    fn new(
        op: ReduceOp,
        contributors: u32,
    ) -> Self {
        Self {
            op,
            values: vec![None; contributors as usize],
            arrived: vec![false; contributors as usize],
            count: 0,
            generation: 0,
        }
    }

    fn reduce(&self) -> Option<f64> {
        self.values
            .iter()
            .flatten()
            .copied()
            .reduce(|acc, value| self.op.apply(acc, value))
    }
}

/// A runtime event.
pub struct Event {
    guid: Guid,
    kind: EventKind,
    /// Expected subscriber count for `Counted` events.
    expected: u32,
    /// Created by the runtime itself (finish-scope latches), retired on firing.
    runtime_owned: bool,
    state: Mutex<EventState>,
}

impl fmt::Debug for Event {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("phase", &state.phase)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Event {
    /// Create an event. `arg` is the initial counter of a latch, the
    /// expected subscriber count of a counted event or the contributor count
    /// of a collective event (reducing with [`ReduceOp::Add`]), ignored
    /// otherwise.
    pub(crate) fn new(
        guid: Guid,
        kind: EventKind,
        arg: u32,
        runtime_owned: bool,
    ) -> Self {
        Self::with_op(guid, kind, arg, ReduceOp::Add, runtime_owned)
    }

    /// Create a collective event over `contributors` slots.
    pub(crate) fn collective(
        guid: Guid,
        contributors: u32,
        op: ReduceOp,
    ) -> Self {
        Self::with_op(guid, EventKind::Collective, contributors, op, false)
    }

    fn with_op(
        guid: Guid,
        kind: EventKind,
        arg: u32,
        op: ReduceOp,
        runtime_owned: bool,
    ) -> Self {
        let counter = if kind == EventKind::Latch {
            i64::from(arg)
        } else {
            0
        };
        let round = (kind == EventKind::Collective).then(|| Round::new(op, arg.max(1)));
        Self {
            guid,
            kind,
            expected: if kind == EventKind::Counted { arg } else { 0 },
            runtime_owned,
            state: Mutex::new(EventState {
                phase: Phase::Open,
                payload: Guid::NULL,
                waiters: SmallVec::new(),
                counter,
                subscribers: 0,
                queued: VecDeque::new(),
                round,
            }),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Number of slots `satisfy` accepts.
    pub fn slot_count(&self) -> u32 {
        match self.kind {
            EventKind::Latch => 2,
            EventKind::Collective => self
                .state
                .lock()
                .round
                .as_ref()
                .map_or(1, |round| round.values.len() as u32),
            _ => 1,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.state.lock().phase == Phase::Fired
    }

    /// Payload recorded by the firing satisfy, if any. For a collective
    /// event: the result of the last completed round.
    pub fn payload(&self) -> Option<Guid> {
        let state = self.state.lock();
        let done = match &state.round {
            Some(round) => round.generation > 0,
            None => state.phase == Phase::Fired,
        };
        done.then_some(state.payload)
    }

    /// Channel payloads waiting for a subscriber.
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Completed collective rounds.
    pub fn generation(&self) -> u64 {
        self.state.lock().round.as_ref().map_or(0, |round| round.generation)
    }

    /// Current latch counter (always 0 for other kinds).
    pub fn counter(&self) -> i64 {
        self.state.lock().counter
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn check_slot(
        &self,
        slot: u32,
    ) -> RuntimeResult<()> {
        if slot < self.slot_count() {
            Ok(())
        } else {
            Err(RuntimeError::SlotOutOfRange {
                guid: self.guid,
                slot,
                count: self.slot_count(),
            })
        }
    }

    /// Apply one satisfy call.
    ///
    /// Returns the deliveries to perform when this call fired the event, and
    /// `None` when it only moved a latch counter or was an idempotent retry.
    pub(crate) fn satisfy(
        &self,
        payload: Guid,
        slot: u32,
    ) -> RuntimeResult<Option<Fanout>> {
        debug_assert_ne!(self.kind, EventKind::Collective, "collective events take contributions");
        self.check_slot(slot)?;
        let mut state = self.state.lock();

        if self.kind == EventKind::Channel {
            if state.waiters.is_empty() {
                state.queued.push_back(payload);
                return Ok(None);
            }
            let consumer = state.waiters.remove(0);
            return Ok(Some(Fanout {
                payload,
                waiters: SmallVec::from_elem(consumer, 1),
                retire: false,
            }));
        }

        if self.kind == EventKind::Latch {
            if state.phase == Phase::Fired {
                return Err(RuntimeError::LatchClosed(self.guid));
            }
            if slot == LATCH_INCR_SLOT {
                state.counter += 1;
                return Ok(None);
            }
            if state.counter <= 0 {
                return Err(RuntimeError::LatchUnderflow(self.guid));
            }
            state.counter -= 1;
            if state.counter > 0 {
                return Ok(None);
            }
            state.phase = Phase::Fired;
            state.payload = payload;
            return Ok(Some(Fanout {
                payload,
                waiters: std::mem::take(&mut state.waiters),
                retire: self.runtime_owned,
            }));
        }

        if state.phase == Phase::Fired {
            return match self.kind {
                EventKind::Idem if state.payload == payload => Ok(None),
                _ => Err(RuntimeError::DuplicateSatisfaction(self.guid)),
            };
        }
        state.phase = Phase::Fired;
        state.payload = payload;
        let retire = self.kind == EventKind::Counted && state.subscribers >= self.expected;
        Ok(Some(Fanout {
            payload,
            waiters: std::mem::take(&mut state.waiters),
            retire,
        }))
    }

    /// Subscribe `waiter`.
    pub(crate) fn register(
        &self,
        waiter: Waiter,
    ) -> RuntimeResult<Registration> {
        let mut state = self.state.lock();
        if self.kind == EventKind::Counted {
            if state.subscribers >= self.expected {
                return Err(RuntimeError::TooManySubscribers {
                    event: self.guid,
                    expected: self.expected,
                });
            }
            state.subscribers += 1;
        }
        if self.kind == EventKind::Channel {
            if let Some(payload) = state.queued.pop_front() {
                return Ok(Registration::Deliver { payload, retire: false });
            }
        }
        match state.phase {
            Phase::Open => {
                state.waiters.push(waiter);
                Ok(Registration::Parked)
            }
            Phase::Fired if self.kind == EventKind::Latch => Err(RuntimeError::LatchClosed(self.guid)),
            Phase::Fired => Ok(Registration::Deliver {
                payload: state.payload,
                retire: self.kind == EventKind::Counted && state.subscribers >= self.expected,
            }),
        }
    }

    /// Record contributor `slot`'s value for the current collective round.
    ///
    /// Returns the finished round when this was the last missing contribution;
    /// the event is then already open for the next round.
    pub(crate) fn contribute(
        &self,
        slot: u32,
        value: Option<f64>,
    ) -> RuntimeResult<Option<Reduced>> {
        let mut state = self.state.lock();
        let Some(round) = state.round.as_mut() else {
            return Err(RuntimeError::SlotOutOfRange {
                guid: self.guid,
                slot,
                count: 0,
            });
        };
        let index = slot as usize;
        if index >= round.values.len() {
            return Err(RuntimeError::SlotOutOfRange {
                guid: self.guid,
                slot,
                count: round.values.len() as u32,
            });
        }
        if round.arrived[index] {
            return Err(RuntimeError::DuplicateSatisfaction(self.guid));
        }
        round.arrived[index] = true;
        round.values[index] = value;
        round.count += 1;
        if (round.count as usize) < round.values.len() {
            return Ok(None);
        }

        let value = round.reduce();
        round.generation += 1;
        round.count = 0;
        round.values.iter_mut().for_each(|v| *v = None);
        round.arrived.iter_mut().for_each(|a| *a = false);
        let generation = round.generation;
        Ok(Some(Reduced {
            value,
            generation,
            waiters: std::mem::take(&mut state.waiters),
        }))
    }

    /// Remember the payload handed out for the last collective round.
    pub(crate) fn record_result(
        &self,
        payload: Guid,
    ) {
        self.state.lock().payload = payload;
    }

    /// Called on explicit destruction; returns the number of stranded waiters.
    pub(crate) fn abandon(&self) -> usize {
        let mut state = self.state.lock();
        let stranded = state.waiters.len();
        state.waiters.clear();
        stranded
    }
}
