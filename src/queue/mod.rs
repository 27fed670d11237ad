//! Device Queue Backends
//!
//! A device queue is the command submission channel of an accelerator. The
//! [`MappedBuffer`](crate::buffer::MappedBuffer) handle never talks to device
//! memory directly: it forwards map and unmap requests to a [`DeviceQueue`]
//! and keeps only the host-side bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! MappedBuffer::map(queue, blocking)
//!       │
//!       ▼
//! DeviceQueue::submit_map  ──►  command queue  ──►  device
//!       │                                              │
//!       ▼                                              ▼
//! Mapping { host ptr, fence } ◄──────────── fence signaled on completion
//! ```
//!
//! # Backends
//!
//! - [`HostQueue`]: simulated device backed by anonymous memory maps, with a
//!   worker thread that completes commands asynchronously.
//! - [`ManualQueue`]: test double whose non-blocking mappings complete only
//!   when the caller says so.

mod fence;
mod host;
mod manual;

pub use fence::MapFence;
pub use host::{HostDevice, HostQueue, QueueStats};
pub use manual::{ManualQueue, Submission};

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// Identifier of one device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Opaque handle to a device allocation.
///
/// The token is move-only: whoever holds it is the single owner of the
/// allocation on the host side. The memory itself belongs to the allocator
/// that minted the token, which must outlive every use of it.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    id: BufferId,
    len: usize,
}

impl DeviceBuffer {
    /// Mint a token for an allocation of `len` bytes.
    ///
    /// Only allocators should call this; the id must name a live allocation
    /// of the backend the buffer will be submitted to.
    pub fn new(id: BufferId, len: usize) -> Self {
        Self { id, len }
    }

    /// Allocation id
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size of the allocation in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the allocation is zero bytes long
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Shared owner of mapped memory, kept alive for as long as a mapping is held
pub type MappingOwner = Arc<dyn Any + Send + Sync>;

/// A host address returned by a map submission, together with the fence
/// that tells when the address becomes safe to dereference.
pub struct Mapping {
    ptr: NonNull<u8>,
    fence: MapFence,
    owner: Option<MappingOwner>,
}

impl Mapping {
    pub fn new(ptr: NonNull<u8>, fence: MapFence) -> Self {
        Self {
            ptr,
            fence,
            owner: None,
        }
    }

    /// Tie the lifetime of the memory behind `ptr` to this mapping
    pub fn with_owner(mut self, owner: MappingOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Host address of the first byte of the mapped region
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Completion fence of the map command
    pub fn fence(&self) -> &MapFence {
        &self.fence
    }

    pub fn into_parts(self) -> (NonNull<u8>, MapFence, Option<MappingOwner>) {
        (self.ptr, self.fence, self.owner)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("fence", &self.fence)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

/// Device-side submission failures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device queue is disconnected")]
    Disconnected,

    #[error("unknown device buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("device buffer {0} is already mapped")]
    AlreadyMapped(BufferId),

    #[error("device buffer {0} is not mapped")]
    NotMapped(BufferId),

    #[error("device allocation of {size} bytes failed: {source}")]
    Allocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start queue worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Command submission channel of a device.
///
/// Implementations submit the command and report submission failures. They
/// do not track host-visibility state; that is the handle's job.
///
/// # Safety
///
/// A successful `submit_map` hands out a host address that the handle turns
/// into `&[T]`/`&mut [T]` once the fence is signaled. Implementors must
/// guarantee that the address:
/// - points to at least `buffer.len()` bytes, or the map is rejected
/// - is not read or written by anything else until `submit_unmap` is called
///   for it
/// - stays valid until then, either because the backing memory outlives the
///   mapping or because it is attached with [`Mapping::with_owner`]
pub unsafe trait DeviceQueue {
    /// Enqueue a map command for `buffer`.
    ///
    /// With `blocking` set, the call must not return before the device has
    /// completed the mapping, so the returned fence is already signaled.
    /// Otherwise the call returns once the command is enqueued and the caller
    /// has to wait on the fence (or drain the queue) before touching memory.
    fn submit_map(&self, buffer: &DeviceBuffer, blocking: bool) -> BackendResult<Mapping>;

    /// Enqueue an unmap command for `buffer`, previously mapped at `host_ptr`.
    ///
    /// This only enqueues; the caller must drain the queue before device-side
    /// work reads or writes the buffer again.
    fn submit_unmap(&self, buffer: &DeviceBuffer, host_ptr: NonNull<u8>) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_id_display() {
        assert_eq!(BufferId(7).to_string(), "buf#7");
    }

    #[test]
    fn test_device_buffer_accessors() {
        let buffer = DeviceBuffer::new(BufferId(3), 128);
        assert_eq!(buffer.id(), BufferId(3));
        assert_eq!(buffer.len(), 128);
        assert!(!buffer.is_empty());
        assert!(DeviceBuffer::new(BufferId(4), 0).is_empty());
    }

    #[test]
    fn test_backend_error_messages() {
        let err = BackendError::AlreadyMapped(BufferId(9));
        assert_eq!(err.to_string(), "device buffer buf#9 is already mapped");
        assert_eq!(
            BackendError::Disconnected.to_string(),
            "device queue is disconnected"
        );
    }
}
