//! Data objects
//!
//! A data object is a reference-counted byte buffer named by a Guid. Tasks gain
//! access through dependency slots or explicit [`acquire`](DataObject::acquire)
//! calls, and the object tracks who holds it under which [`AccessMode`].
//!
//! Storage is released exactly once: when a destroy has been requested *and* the
//! last holder has let go. Access modes are advisory; the runtime records them
//! but does not serialize readers against writers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::guid::Guid;

/// Access mode requested by a holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessMode {
    /// No access to the contents; the slot only orders execution.
    Null,
    /// Read-only, and the contents will not change while held.
    Const,
    /// Read-write, concurrent writers allowed.
    #[default]
    ReadWrite,
    /// Read-write, the holder expects to be the only writer.
    ExclusiveWrite,
    /// Read-only, other holders may still write.
    ReadOnly,
}

impl AccessMode {
    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::ExclusiveWrite)
    }
}

/// Buffer shared between holders without synchronization.
struct SyncBuffer {
    raw: *mut [u8],
}

// SAFETY: concurrent access is governed by the holders' access modes; writers
// go through `unsafe` accessors whose contract forbids overlapping access.
unsafe impl Send for SyncBuffer {}
unsafe impl Sync for SyncBuffer {}

impl SyncBuffer {
    fn zeroed(len: usize) -> RuntimeResult<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| RuntimeError::AllocationFailed(len))?;
        bytes.resize(len, 0);
        Ok(Self {
            raw: Box::into_raw(bytes.into_boxed_slice()),
        })
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.raw as *mut u8
    }
}

impl Drop for SyncBuffer {
    fn drop(&mut self) {
        // SAFETY: `raw` came from `Box::into_raw` and is dropped once.
        unsafe { drop(Box::from_raw(self.raw)) }
    }
}

#[derive(Debug, Default)]
struct Holder {
    count: u32,
    modes: SmallVec<[AccessMode; 2]>,
}

#[derive(Debug)]
struct DataState {
    refcount: u32,
    holders: HashMap<Guid, Holder>,
    destroy_requested: bool,
    freed: bool,
}

impl DataState {
    /// Storage may go once nobody holds it and a destroy was requested.
    fn try_free(&mut self) -> bool {
        if self.destroy_requested && self.refcount == 0 && !self.freed {
            self.freed = true;
            true
        } else {
            false
        }
    }
}

/// A runtime data object.
pub struct DataObject {
    guid: Guid,
    creator: Guid,
    len: usize,
    buffer: SyncBuffer,
    state: Mutex<DataState>,
}

impl fmt::Debug for DataObject {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataObject")
            .field("guid", &self.guid)
            .field("len", &self.len)
            .field("refcount", &state.refcount)
            .field("destroy_requested", &state.destroy_requested)
            .finish()
    }
}

impl DataObject {
    /// Allocate a zeroed object of `len` bytes held once by `creator`.
    ///
    /// `creator` is the creating task, or [`Guid::NULL`] when created outside
    /// any task.
    pub(crate) fn new(
        guid: Guid,
        creator: Guid,
        len: usize,
        max_len: usize,
    ) -> RuntimeResult<Self> {
        if len > max_len {
            return Err(RuntimeError::AllocationFailed(len));
        }
        let mut holders = HashMap::new();
        holders.insert(
            creator,
            Holder {
                count: 1,
                modes: SmallVec::from_elem(AccessMode::ReadWrite, 1),
            },
        );
        Ok(Self {
            guid,
            creator,
            len,
            buffer: SyncBuffer::zeroed(len)?,
            state: Mutex::new(DataState {
                refcount: 1,
                holders,
                destroy_requested: false,
                freed: false,
            }),
        })
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn creator(&self) -> Guid {
        self.creator
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn refcount(&self) -> u32 {
        self.state.lock().refcount
    }

    pub fn is_destroy_requested(&self) -> bool {
        self.state.lock().destroy_requested
    }

    /// Modes under which `task` currently holds this object.
    pub fn modes_held_by(
        &self,
        task: Guid,
    ) -> Vec<AccessMode> {
        self.state
            .lock()
            .holders
            .get(&task)
            .map(|holder| holder.modes.to_vec())
            .unwrap_or_default()
    }

    /// Record one more reference held by `task`.
    pub(crate) fn acquire(
        &self,
        task: Guid,
        mode: AccessMode,
    ) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        if state.freed {
            return Err(RuntimeError::AlreadyDestroyed(self.guid));
        }
        if state.destroy_requested {
            return Err(RuntimeError::DestroyPending(self.guid));
        }
        let holder = state.holders.entry(task).or_default();
        holder.count += 1;
        holder.modes.push(mode);
        state.refcount += 1;
        Ok(())
    }

    /// Drop one reference held by `task`. Returns whether storage was freed.
    pub(crate) fn release(
        &self,
        task: Guid,
    ) -> RuntimeResult<bool> {
        let mut state = self.state.lock();
        let Some(holder) = state.holders.get_mut(&task) else {
            return Err(RuntimeError::NotAcquired {
                guid: self.guid,
                task,
            });
        };
        holder.count -= 1;
        holder.modes.pop();
        if holder.count == 0 {
            state.holders.remove(&task);
        }
        state.refcount -= 1;
        Ok(state.try_free())
    }

    /// Mark the object for destruction and drop the creator's own reference if
    /// it is still held. Returns whether storage was freed.
    pub(crate) fn request_destroy(&self) -> RuntimeResult<bool> {
        let mut state = self.state.lock();
        if state.destroy_requested {
            return Err(RuntimeError::AlreadyDestroyed(self.guid));
        }
        state.destroy_requested = true;
        let creator = self.creator;
        if let Some(holder) = state.holders.get_mut(&creator) {
            holder.count -= 1;
            holder.modes.remove(0);
            if holder.count == 0 {
                state.holders.remove(&creator);
            }
            state.refcount -= 1;
        }
        Ok(state.try_free())
    }
}

/// A holder's view of a data object's storage.
///
/// The handle keeps the allocation alive, but access rights end when the
/// holder releases the object; touching the bytes after that is a logic error.
#[derive(Clone)]
pub struct DataHandle {
    object: Arc<DataObject>,
    mode: AccessMode,
}

impl fmt::Debug for DataHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("guid", &self.object.guid)
            .field("mode", &self.mode)
            .field("len", &self.object.len)
            .finish()
    }
}

impl DataHandle {
    pub(crate) fn new(
        object: Arc<DataObject>,
        mode: AccessMode,
    ) -> Self {
        Self { object, mode }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.object.guid
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.object.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.object.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.object.buffer.ptr()
    }

    /// Borrow the contents.
    ///
    /// # Safety
    ///
    /// No other holder may write to the object while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len())
    }

    /// Borrow the contents mutably.
    ///
    /// # Safety
    ///
    /// No other holder may read or write the object while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.len())
    }

    /// Read the `index`-th little-endian `u64`.
    pub fn read_u64(
        &self,
        index: usize,
    ) -> Option<u64> {
        let offset = index.checked_mul(8)?;
        if offset.checked_add(8)? > self.len() {
            return None;
        }
        // SAFETY: in bounds; writers are bound by the `write_u64` contract.
        let raw = unsafe { std::ptr::read_unaligned(self.as_ptr().add(offset) as *const u64) };
        Some(u64::from_le(raw))
    }

    /// Store `value` as the `index`-th little-endian `u64`.
    ///
    /// # Safety
    ///
    /// No other holder may access the same bytes concurrently.
    pub unsafe fn write_u64(
        &self,
        index: usize,
        value: u64,
    ) -> bool {
        let Some(offset) = index.checked_mul(8) else {
            return false;
        };
        if offset.saturating_add(8) > self.len() {
            return false;
        }
        std::ptr::write_unaligned(self.as_ptr().add(offset) as *mut u64, value.to_le());
        true
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        // SAFETY: see `read_u64`.
        unsafe { self.as_slice().to_vec() }
    }
}
