//! Comm boundary
//!
//! Operations whose target Guid lives on another node are turned into a
//! [`RemoteMessage`] and handed to a [`CommLayer`]. The layer must preserve
//! delivery order between any two endpoints; nothing is assumed across
//! different endpoint pairs.

mod fabric;

pub use fabric::LocalFabric;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;
use crate::runtime::datablock::AccessMode;
use crate::runtime::guid::Guid;

/// Operation carried by a remote message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Satisfy event `target` with `payload` on `slot`.
    Satisfy,
    /// Wire `payload` (the source) to slot `slot` of `target`.
    AddDependency,
    /// Resolve slot `slot` of `target` with `payload`.
    Signal,
    /// Acquire data object `target` on behalf of `requester`.
    Acquire,
    /// Release one reference `requester` holds on `target`.
    Release,
    Destroy,
}

/// A runtime operation serialized for another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub operation: Operation,
    /// Sending node.
    pub origin: u16,
    pub target: Guid,
    pub payload: Guid,
    pub slot: u32,
    pub mode: AccessMode,
    pub requester: Guid,
}

impl RemoteMessage {
    pub fn new(
        operation: Operation,
        origin: u16,
        target: Guid,
    ) -> Self {
        Self {
            operation,
            origin,
            target,
            payload: Guid::NULL,
            slot: 0,
            mode: AccessMode::default(),
            requester: Guid::NULL,
        }
    }

    pub fn with_payload(
        mut self,
        payload: Guid,
    ) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_slot(
        mut self,
        slot: u32,
    ) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_mode(
        mut self,
        mode: AccessMode,
    ) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_requester(
        mut self,
        requester: Guid,
    ) -> Self {
        self.requester = requester;
        self
    }
}

/// Transport between nodes.
pub trait CommLayer: Send + Sync + fmt::Debug {
    /// Queue `message` for delivery to `node`.
    fn send(
        &self,
        node: u16,
        message: RemoteMessage,
    ) -> RuntimeResult<()>;
}
