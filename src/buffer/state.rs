//! Host-visibility states and the operations that move between them

use std::fmt;

/// Host-visibility state of a [`MappedBuffer`](super::MappedBuffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// No device allocation attached
    Unallocated,
    /// Device allocation attached, not visible to the host
    Allocated,
    /// Device allocation visible at a host address
    Mapped,
}

impl BufferState {
    /// All states, in lifecycle order
    pub const ALL: [BufferState; 3] = [
        BufferState::Unallocated,
        BufferState::Allocated,
        BufferState::Mapped,
    ];

    /// State reached by applying `op`, or `None` if `op` is not allowed here
    pub fn after(self, op: Operation) -> Option<BufferState> {
        match (self, op) {
            (BufferState::Unallocated, Operation::Allocate) => Some(BufferState::Allocated),
            (BufferState::Allocated, Operation::Map) => Some(BufferState::Mapped),
            (BufferState::Mapped, Operation::Unmap) => Some(BufferState::Allocated),
            (BufferState::Allocated, Operation::Free) => Some(BufferState::Unallocated),
            (BufferState::Mapped, Operation::Access) => Some(BufferState::Mapped),
            _ => None,
        }
    }

    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            BufferState::Unallocated => "unallocated",
            BufferState::Allocated => "allocated",
            BufferState::Mapped => "mapped",
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Operations on a mapped-buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Allocate,
    Map,
    Unmap,
    Free,
    /// Reading or writing through the typed accessor
    Access,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Allocate,
        Operation::Map,
        Operation::Unmap,
        Operation::Free,
        Operation::Access,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Allocate => "allocate",
            Operation::Map => "map",
            Operation::Unmap => "unmap",
            Operation::Free => "free",
            Operation::Access => "access",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}
