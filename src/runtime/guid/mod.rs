//! Guids and the object registry
//!
//! Every runtime object is named by a [`Guid`], never by a pointer. A Guid is a
//! packed 64-bit value:
//!
//! ```text
//! 63      60 59          48 47                                0
//! +---------+--------------+-----------------------------------+
//! |  kind   |  home node   |             sequence              |
//! +---------+--------------+-----------------------------------+
//! ```
//!
//! The kind tag is recoverable without a registry lookup, and the home node
//! tells the runtime whether an operation must be shipped over the comm
//! boundary. Sequences are handed out monotonically per node and are never
//! reused, which is what lets the [`Registry`] tell a destroyed Guid apart from
//! one that never existed.

mod registry;

pub use registry::{GuidState, Object, Registry};
pub(crate) use registry::Subscription;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

const KIND_SHIFT: u32 = 60;
const NODE_SHIFT: u32 = 48;
const NODE_MASK: u64 = 0xFFF;
const SEQ_MASK: u64 = (1 << NODE_SHIFT) - 1;

/// Number of addressable nodes.
pub const MAX_NODES: u32 = (NODE_MASK + 1) as u32;

/// Largest sequence number a node can hand out.
pub const MAX_SEQUENCE: u64 = SEQ_MASK;

/// Largest number of Guids a single range may reserve.
pub const MAX_RANGE_LEN: u64 = 1 << 32;

/// Kind tag embedded in every Guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuidKind {
    /// The null Guid, or a value with an unrecognised tag.
    None = 0,
    TaskTemplate = 1,
    Task = 2,
    Event = 3,
    DataObject = 4,
    GuidRange = 5,
}

impl GuidKind {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => GuidKind::TaskTemplate,
            2 => GuidKind::Task,
            3 => GuidKind::Event,
            4 => GuidKind::DataObject,
            5 => GuidKind::GuidRange,
            _ => GuidKind::None,
        }
    }
}

impl fmt::Display for GuidKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            GuidKind::None => "none",
            GuidKind::TaskTemplate => "template",
            GuidKind::Task => "task",
            GuidKind::Event => "event",
            GuidKind::DataObject => "data object",
            GuidKind::GuidRange => "guid range",
        };
        f.write_str(name)
    }
}

/// Opaque identifier naming a runtime object independently of its location.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(u64);

impl Guid {
    /// The "no value" sentinel.
    pub const NULL: Guid = Guid(0);

    /// Pack a Guid from its parts.
    #[inline]
    pub fn new(
        kind: GuidKind,
        node: u16,
        seq: u64,
    ) -> Self {
        debug_assert!(u64::from(node) <= NODE_MASK);
        debug_assert!(seq <= SEQ_MASK);
        Guid(
            ((kind as u64) << KIND_SHIFT)
                | ((u64::from(node) & NODE_MASK) << NODE_SHIFT)
                | (seq & SEQ_MASK),
        )
    }

    /// Rebuild a Guid from a raw value, e.g. one carried in a parameter vector.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Guid(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn kind(self) -> GuidKind {
        GuidKind::from_bits(self.0 >> KIND_SHIFT)
    }

    /// Home node owning the registry entry.
    #[inline]
    pub fn node(self) -> u16 {
        ((self.0 >> NODE_SHIFT) & NODE_MASK) as u16
    }

    #[inline]
    pub fn seq(self) -> u64 {
        self.0 & SEQ_MASK
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Fail with [`RuntimeError::KindMismatch`] unless the tag is `expected`.
    pub fn expect_kind(
        self,
        expected: GuidKind,
    ) -> RuntimeResult<Self> {
        let actual = self.kind();
        if actual == expected {
            Ok(self)
        } else if self.is_null() {
            Err(RuntimeError::UnknownGuid(self))
        } else {
            Err(RuntimeError::KindMismatch {
                guid: self,
                expected,
                actual,
            })
        }
    }
}

impl fmt::Debug for Guid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Guid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Guid(null)");
        }
        write!(f, "Guid({}@{}:{})", self.kind(), self.node(), self.seq())
    }
}

/// A contiguous block of Guids reserved before the objects they name exist.
///
/// Each index is instantiated individually later on, which lets application
/// code wire dependencies toward objects it has not created yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidRange {
    guid: Guid,
    kind: GuidKind,
    node: u16,
    base: u64,
    len: u64,
}

impl GuidRange {
    pub(crate) fn new(
        guid: Guid,
        kind: GuidKind,
        base: u64,
        len: u64,
    ) -> Self {
        Self {
            guid,
            kind,
            node: guid.node(),
            base,
            len,
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Kind of the objects this range will hold.
    #[inline]
    pub fn kind(&self) -> GuidKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Guid reserved at `index`.
    pub fn guid_at(
        &self,
        index: u64,
    ) -> RuntimeResult<Guid> {
        if index >= self.len {
            return Err(RuntimeError::RangeIndexOutOfBounds {
                range: self.guid,
                index,
                len: self.len,
            });
        }
        Ok(Guid::new(self.kind, self.node, self.base + index))
    }

    /// Whether `guid` was reserved by this range.
    pub fn contains(
        &self,
        guid: Guid,
    ) -> bool {
        guid.kind() == self.kind
            && guid.node() == self.node
            && guid.seq() >= self.base
            && guid.seq() < self.base + self.len
    }

    /// Sequence number of index 0.
    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }
}
