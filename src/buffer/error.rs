//! Mapped-buffer errors
//!
//! Every variant names the operation that was attempted and, where it
//! matters, the state the handle was observed in. Precondition violations are
//! raised before anything is submitted to a queue.

use super::state::{BufferState, Operation};
use crate::queue::{BackendError, DeviceBuffer};
use bytemuck::PodCastError;
use thiserror::Error;

/// Errors returned by [`MappedBuffer`](super::MappedBuffer) operations.
#[derive(Debug, Error)]
pub enum MapError {
    /// `allocate` on a handle that already holds an allocation. The offered
    /// buffer is handed back so it can be released.
    #[error("allocate: buffer is already allocated (state: {state})")]
    AlreadyAllocated {
        state: BufferState,
        rejected: DeviceBuffer,
    },

    #[error("{op}: buffer is not allocated (state: {state})")]
    NotAllocated { op: Operation, state: BufferState },

    /// Map or unmap called out of sequence, or data accessed while unmapped
    #[error("{op}: not allowed in state {state}")]
    InvalidState { op: Operation, state: BufferState },

    #[error("free: buffer is still mapped, unmap it first (state: {state})")]
    BufferStillMapped { state: BufferState },

    /// A non-blocking mapping whose map command has not completed yet
    #[error(
        "{op}: mapping has not completed, wait on the queue before dereferencing (state: {state})"
    )]
    MappingPending { op: Operation, state: BufferState },

    /// The backend handed out an address or length that `[T]` cannot cover
    #[error("{op}: mapped region cannot be viewed as {ty}: {reason:?} (state: {state})")]
    Layout {
        op: Operation,
        state: BufferState,
        ty: &'static str,
        reason: PodCastError,
    },

    /// The device queue refused the command; passed through unchanged
    #[error("{op}: device queue submission failed (state: {state}): {source}")]
    Backend {
        op: Operation,
        state: BufferState,
        #[source]
        source: BackendError,
    },
}

impl MapError {
    /// Operation that failed
    pub fn operation(&self) -> Operation {
        match self {
            MapError::AlreadyAllocated { .. } => Operation::Allocate,
            MapError::BufferStillMapped { .. } => Operation::Free,
            MapError::NotAllocated { op, .. }
            | MapError::InvalidState { op, .. }
            | MapError::MappingPending { op, .. }
            | MapError::Layout { op, .. }
            | MapError::Backend { op, .. } => *op,
        }
    }

    /// Whether the error is caller misuse rather than a device failure
    pub fn is_precondition(&self) -> bool {
        !matches!(self, MapError::Backend { .. } | MapError::Layout { .. })
    }

    /// State the handle was in when the operation was rejected
    pub fn state(&self) -> BufferState {
        match self {
            MapError::AlreadyAllocated { state, .. }
            | MapError::NotAllocated { state, .. }
            | MapError::InvalidState { state, .. }
            | MapError::BufferStillMapped { state }
            | MapError::MappingPending { state, .. }
            | MapError::Layout { state, .. }
            | MapError::Backend { state, .. } => *state,
        }
    }

    /// Recover the buffer rejected by `allocate`
    pub fn into_rejected_buffer(self) -> Option<DeviceBuffer> {
        match self {
            MapError::AlreadyAllocated { rejected, .. } => Some(rejected),
            _ => None,
        }
    }
}

/// Result type for mapped-buffer operations.
pub type MapResult<T> = Result<T, MapError>;
