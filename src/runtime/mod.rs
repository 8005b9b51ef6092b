//! Runtime system
//!
//! [`Runtime`] is a cheap, clonable handle on one node's registry, scheduler
//! and comm boundary. Everything an application does goes through it: creating
//! templates, tasks, events and data objects, wiring dependency edges, and
//! satisfying events.
//!
//! ```no_run
//! use epochrt::runtime::{EventKind, Runtime};
//! use epochrt::util::config::RuntimeConfig;
//! use epochrt::Guid;
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let done = rt.create_event(EventKind::Sticky).unwrap();
//! let hello = rt
//!     .create_template("hello", |ctx, _params, _deps| {
//!         tracing::info!(task = %ctx.task(), "hello");
//!         Ok(Guid::NULL)
//!     })
//!     .unwrap();
//! let spawned = rt.task_builder(hello).slots(1).dependencies([done]).spawn().unwrap();
//! rt.satisfy(done, Guid::NULL, 0).unwrap();
//! rt.wait_idle();
//! # let _ = spawned;
//! ```

pub mod comm;
pub mod context;
pub mod datablock;
pub mod event;
pub mod guid;
pub mod scheduler;
pub mod stats;
pub mod task;

mod engine;
mod exec;
mod finish;
mod objects;

pub use comm::{CommLayer, LocalFabric, Operation, RemoteMessage};
pub use context::TaskContext;
pub use datablock::{AccessMode, DataHandle};
pub use event::{EventKind, ReduceOp, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
pub use guid::{Guid, GuidKind, GuidRange, GuidState};
pub use scheduler::{ReadyTask, Scheduler, SchedulerKind};
pub use stats::{RuntimeStats, StatsSnapshot};
pub use task::builder::{Spawned, TaskBuilder};
pub use task::{Arity, Dependency, SlotCount, TaskProperties, TaskState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};
use crate::util::config::RuntimeConfig;
use guid::{Object, Registry, MAX_NODES};
use task::Template;

pub(crate) struct Inner {
    config: RuntimeConfig,
    registry: Registry,
    scheduler: Arc<dyn Scheduler>,
    comm: RwLock<Option<Arc<dyn CommLayer>>>,
    stats: RuntimeStats,
    /// Tasks created and not yet completed or cancelled.
    outstanding: Mutex<u64>,
    idle: Condvar,
    shut_down: AtomicBool,
    shutdown_lock: Mutex<()>,
    shutdown_cv: Condvar,
    continuation: Arc<Template>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Handle on one node's runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by comm dispatchers.
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<Inner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.node())
            .field("scheduler", &self.inner.scheduler.name())
            .field("live_objects", &self.inner.registry.live_count())
            .finish()
    }
}

impl Runtime {
    /// Build a runtime with the scheduler selected by `config`.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let scheduler = scheduler::build(&config.scheduler)?;
        Self::with_scheduler(config, scheduler)
    }

    /// Build a runtime on top of an existing scheduler.
    pub fn with_scheduler(
        config: RuntimeConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> RuntimeResult<Self> {
        let node = config.runtime.node_id;
        if u32::from(node) >= MAX_NODES {
            return Err(RuntimeError::UnreachableNode(node));
        }
        let registry = Registry::new(node, config.runtime.registry_shards);
        let (_, object) = registry.create(GuidKind::TaskTemplate, |guid| {
            Ok(Object::Template(Arc::new(finish::continuation_template(guid))))
        })?;
        let Object::Template(continuation) = object else {
            unreachable!("template guid bound to another kind");
        };

        info!(node, scheduler = scheduler.name(), "runtime started");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                scheduler,
                comm: RwLock::new(None),
                stats: RuntimeStats::default(),
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
                shut_down: AtomicBool::new(false),
                shutdown_lock: Mutex::new(()),
                shutdown_cv: Condvar::new(),
                continuation,
            }),
        })
    }

    /// Single-node runtime on the inline scheduler.
    pub fn inline() -> RuntimeResult<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub fn node(&self) -> u16 {
        self.inner.registry.node()
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn stats(&self) -> &RuntimeStats {
        &self.inner.stats
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[inline]
    pub(crate) fn continuation_template(&self) -> &Arc<Template> {
        &self.inner.continuation
    }

    /// Install the transport used for Guids owned by other nodes.
    pub fn set_comm(
        &self,
        comm: Arc<dyn CommLayer>,
    ) {
        *self.inner.comm.write() = Some(comm);
    }

    /// What the registry currently knows about `guid`.
    pub fn guid_state(
        &self,
        guid: Guid,
    ) -> GuidState {
        self.inner.registry.state(guid)
    }

    /// Number of live objects on this node.
    pub fn live_objects(&self) -> usize {
        self.inner.registry.live_count()
    }

    // ------------------------------------------------------------------
    // Quiescence and shutdown
    // ------------------------------------------------------------------

    pub(crate) fn ensure_running(&self) -> RuntimeResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            Err(RuntimeError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn task_opened(&self) {
        *self.inner.outstanding.lock() += 1;
    }

    pub(crate) fn task_closed(&self) {
        let mut outstanding = self.inner.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.inner.idle.notify_all();
        }
    }

    /// Number of tasks created and not yet completed.
    pub fn outstanding_tasks(&self) -> u64 {
        *self.inner.outstanding.lock()
    }

    /// Block until every created task has completed.
    pub fn wait_idle(&self) {
        let mut outstanding = self.inner.outstanding.lock();
        while *outstanding > 0 {
            self.inner.idle.wait(&mut outstanding);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with a deadline; returns whether
    /// the runtime became idle.
    pub fn wait_idle_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.outstanding.lock();
        while *outstanding > 0 {
            if self
                .inner
                .idle
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                return *outstanding == 0;
            }
        }
        true
    }

    /// Request termination. Running tasks finish; creating anything new
    /// afterwards fails with [`RuntimeError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(node = self.node(), "shutdown requested");
        let _guard = self.inner.shutdown_lock.lock();
        self.inner.shutdown_cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Block until some task or caller requests shutdown.
    pub fn wait_for_shutdown(&self) {
        let mut guard = self.inner.shutdown_lock.lock();
        while !self.is_shut_down() {
            self.inner.shutdown_cv.wait(&mut guard);
        }
    }

    // ------------------------------------------------------------------
    // Remote plumbing
    // ------------------------------------------------------------------

    /// Hand `message` to the comm layer for `node`.
    pub(crate) fn send_remote(
        &self,
        node: u16,
        message: RemoteMessage,
    ) -> RuntimeResult<()> {
        let comm = self.inner.comm.read().clone();
        let Some(comm) = comm else {
            return Err(RuntimeError::UnreachableNode(node));
        };
        tracing::trace!(node, op = ?message.operation, target = %message.target, "send remote");
        comm.send(node, message)?;
        RuntimeStats::bump(&self.inner.stats.remote_sent);
        Ok(())
    }

    /// Apply an operation shipped from another node.
    pub fn handle_remote(
        &self,
        message: RemoteMessage,
    ) -> RuntimeResult<()> {
        RuntimeStats::bump(&self.inner.stats.remote_received);
        tracing::trace!(origin = message.origin, op = ?message.operation, target = %message.target, "handle remote");
        match message.operation {
            Operation::Satisfy => self.satisfy(message.target, message.payload, message.slot),
            Operation::AddDependency => {
                self.add_dependency(message.payload, message.target, message.slot, message.mode)
            }
            Operation::Signal => self.signal(
                message.target,
                message.slot,
                message.payload,
                message.mode,
                engine::Delivery::Lenient,
            ),
            Operation::Acquire => self
                .acquire(message.target, message.requester, message.mode)
                .map(drop),
            Operation::Release => self.release(message.target, message.requester),
            Operation::Destroy => self.destroy(message.target),
        }
    }
}

#[cfg(test)]
mod tests;
