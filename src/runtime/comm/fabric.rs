//! In-process fabric connecting several runtimes.
//!
//! Each attached node gets an unbounded crossbeam channel and a dispatcher
//! thread that applies incoming messages in arrival order, which gives the
//! per-endpoint FIFO delivery the comm boundary promises.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{CommLayer, RemoteMessage};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;

#[derive(Debug, Default)]
pub struct LocalFabric {
    endpoints: RwLock<HashMap<u16, Sender<RemoteMessage>>>,
    dispatchers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `runtime` to the fabric and start its dispatcher.
    pub fn attach(
        self: &Arc<Self>,
        runtime: &Runtime,
    ) -> RuntimeResult<()> {
        let node = runtime.node();
        let (tx, rx) = channel::unbounded::<RemoteMessage>();
        let weak = runtime.downgrade();
        let handle = thread::Builder::new()
            .name(format!("epochrt-comm-{}", node))
            .spawn(move || {
                for message in rx {
                    let Some(runtime) = weak.upgrade() else {
                        break;
                    };
                    let operation = message.operation;
                    let target = message.target;
                    if let Err(e) = runtime.handle_remote(message) {
                        warn!(node, ?operation, %target, error = %e, "remote operation failed");
                    }
                }
                debug!(node, "comm dispatcher exited");
            })
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        self.endpoints.write().insert(node, tx);
        self.dispatchers.lock().push(handle);
        runtime.set_comm(self.clone());
        debug!(node, "attached to local fabric");
        Ok(())
    }

    /// Disconnect `node`; its dispatcher exits once its queue drains.
    pub fn detach(
        &self,
        node: u16,
    ) -> bool {
        self.endpoints.write().remove(&node).is_some()
    }

    pub fn nodes(&self) -> Vec<u16> {
        let mut nodes: Vec<u16> = self.endpoints.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Disconnect every node and join the dispatchers.
    pub fn close(&self) {
        self.endpoints.write().clear();
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.dispatchers.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl CommLayer for LocalFabric {
    fn send(
        &self,
        node: u16,
        message: RemoteMessage,
    ) -> RuntimeResult<()> {
        let endpoints = self.endpoints.read();
        let sender = endpoints
            .get(&node)
            .ok_or(RuntimeError::UnreachableNode(node))?;
        sender
            .send(message)
            .map_err(|_| RuntimeError::UnreachableNode(node))
    }
}

impl Drop for LocalFabric {
    fn drop(&mut self) {
        self.close();
    }
}
