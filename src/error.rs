//! Runtime errors
//!
//! Every protocol violation and resource failure is surfaced to the caller as a
//! [`RuntimeError`]. Nothing here is recovered by guessing intent.

use thiserror::Error;

use crate::runtime::guid::{Guid, GuidKind};

/// Runtime result
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    // === Guid lifetime ===
    #[error("{0} was already destroyed")]
    AlreadyDestroyed(Guid),

    #[error("{0} does not name any object")]
    UnknownGuid(Guid),

    #[error("{0} is reserved but not yet instantiated")]
    NotYetPresent(Guid),

    #[error("{0} is already bound to an object")]
    AlreadyBound(Guid),

    #[error("{guid} is a {actual}, expected {expected}")]
    KindMismatch {
        guid: Guid,
        expected: GuidKind,
        actual: GuidKind,
    },

    #[error("index {index} is out of bounds for {range} ({len} guids)")]
    RangeIndexOutOfBounds { range: Guid, index: u64, len: u64 },

    #[error("a range of {len} guids exceeds the limit of {max}")]
    RangeTooLarge { len: u64, max: u64 },

    // === Events ===
    #[error("{0} was already satisfied")]
    DuplicateSatisfaction(Guid),

    #[error("latch {0} already reached zero")]
    LatchClosed(Guid),

    #[error("latch {0} would go below zero")]
    LatchUnderflow(Guid),

    #[error("{event} accepts at most {expected} subscribers")]
    TooManySubscribers { event: Guid, expected: u32 },

    // === Dependency slots ===
    #[error("slot {slot} is out of range for {guid} ({count} slots)")]
    SlotOutOfRange { guid: Guid, slot: u32, count: u32 },

    #[error("slot {slot} of {task} is already wired")]
    SlotAlreadyWired { task: Guid, slot: u32 },

    #[error("slot {slot} of {task} is already resolved")]
    SlotAlreadyResolved { task: Guid, slot: u32 },

    #[error("{0} received more slot resolutions than it declares")]
    DependencyOverflow(Guid),

    #[error("{template} declares {expected} {what}, got {actual}")]
    ArityMismatch {
        template: Guid,
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("{0} is variadic; an explicit dependency count is required")]
    UnknownArity(Guid),

    #[error("{0} was already released to the scheduler")]
    TaskAlreadyReleased(Guid),

    // === Data objects ===
    #[error("{guid} is not held by {task}")]
    NotAcquired { guid: Guid, task: Guid },

    #[error("{0} has a pending destroy request")]
    DestroyPending(Guid),

    // === Resources ===
    #[error("guid space exhausted on node {0}")]
    GuidExhausted(u16),

    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),

    // === Boundaries ===
    #[error("node {0} is not reachable")]
    UnreachableNode(u16),

    #[error("runtime is shut down")]
    ShutDown,

    #[error("failed to start runtime threads: {0}")]
    SpawnFailed(String),
}

impl RuntimeError {
    /// Stable numeric code handed to callers that route errors through events.
    pub fn code(&self) -> u16 {
        match self {
            RuntimeError::AlreadyDestroyed(_) => 1,
            RuntimeError::UnknownGuid(_) => 2,
            RuntimeError::NotYetPresent(_) => 3,
            RuntimeError::AlreadyBound(_) => 4,
            RuntimeError::KindMismatch { .. } => 5,
            RuntimeError::RangeIndexOutOfBounds { .. } => 6,
            RuntimeError::RangeTooLarge { .. } => 7,
            RuntimeError::DuplicateSatisfaction(_) => 10,
            RuntimeError::LatchClosed(_) => 11,
            RuntimeError::LatchUnderflow(_) => 12,
            RuntimeError::TooManySubscribers { .. } => 13,
            RuntimeError::SlotOutOfRange { .. } => 20,
            RuntimeError::SlotAlreadyWired { .. } => 21,
            RuntimeError::SlotAlreadyResolved { .. } => 22,
            RuntimeError::DependencyOverflow(_) => 23,
            RuntimeError::ArityMismatch { .. } => 24,
            RuntimeError::UnknownArity(_) => 25,
            RuntimeError::TaskAlreadyReleased(_) => 26,
            RuntimeError::NotAcquired { .. } => 30,
            RuntimeError::DestroyPending(_) => 31,
            RuntimeError::GuidExhausted(_) => 40,
            RuntimeError::AllocationFailed(_) => 41,
            RuntimeError::UnreachableNode(_) => 50,
            RuntimeError::ShutDown => 51,
            RuntimeError::SpawnFailed(_) => 52,
        }
    }

    /// Whether the caller may retry after freeing resources.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            RuntimeError::GuidExhausted(_) | RuntimeError::AllocationFailed(_)
        )
    }

    /// Programming errors in the application or in another runtime component.
    pub fn is_protocol_violation(&self) -> bool {
        !self.is_resource_exhaustion()
            && !matches!(
                self,
                RuntimeError::UnreachableNode(_)
                    | RuntimeError::ShutDown
                    | RuntimeError::SpawnFailed(_)
            )
    }
}
