//! Mapped-buffer handle

use super::error::{MapError, MapResult};
use super::state::{BufferState, Operation};
use crate::queue::{DeviceBuffer, DeviceQueue, MapFence, MappingOwner};
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use tracing::{debug, warn};

/// Host-visibility state together with the data that is only meaningful in it.
///
/// The host address lives inside `Mapped`, so it cannot be observed in any
/// other state and is dropped in the same assignment that leaves `Mapped`.
#[derive(Default)]
enum Slot {
    #[default]
    Unallocated,
    Allocated(DeviceBuffer),
    Mapped {
        buffer: DeviceBuffer,
        host: NonNull<u8>,
        fence: MapFence,
        owner: Option<MappingOwner>,
    },
}

impl Slot {
    fn state(&self) -> BufferState {
        match self {
            Slot::Unallocated => BufferState::Unallocated,
            Slot::Allocated(_) => BufferState::Allocated,
            Slot::Mapped { .. } => BufferState::Mapped,
        }
    }

    fn buffer(&self) -> Option<&DeviceBuffer> {
        match self {
            Slot::Unallocated => None,
            Slot::Allocated(buffer) | Slot::Mapped { buffer, .. } => Some(buffer),
        }
    }
}

/// Host-visibility manager for one device buffer, viewed as elements of `T`.
///
/// The handle is move-only. [`MappedBuffer::take`] transfers the allocation
/// (and mapping, if any) to a new handle and leaves this one unallocated.
///
/// State transitions take `&mut self`; a handle is driven by one owner at a
/// time and needs external locking to be shared between threads.
pub struct MappedBuffer<T> {
    slot: Slot,
    _marker: PhantomData<T>,
}

// Safety: the host address is only dereferenced through `&self`/`&mut self`,
// so the handle follows the usual rules for a container of `T`.
unsafe impl<T: Send> Send for MappedBuffer<T> {}
unsafe impl<T: Sync> Sync for MappedBuffer<T> {}

impl<T: Pod> MappedBuffer<T> {
    /// Create an unallocated handle
    pub fn new() -> Self {
        Self {
            slot: Slot::Unallocated,
            _marker: PhantomData,
        }
    }

    /// Create a handle that starts out holding `buffer`
    pub fn with_buffer(buffer: DeviceBuffer) -> Self {
        Self {
            slot: Slot::Allocated(buffer),
            _marker: PhantomData,
        }
    }

    pub fn state(&self) -> BufferState {
        self.slot.state()
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self.slot, Slot::Unallocated)
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.slot, Slot::Mapped { .. })
    }

    /// The device allocation, while allocated
    pub fn device_buffer(&self) -> Option<&DeviceBuffer> {
        self.slot.buffer()
    }

    /// Number of whole `T` elements in the allocation (0 when unallocated)
    pub fn len(&self) -> usize {
        self.slot
            .buffer()
            .map_or(0, |buffer| element_count::<T>(buffer.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach a device allocation made by an external allocator
    pub fn allocate(&mut self, buffer: DeviceBuffer) -> MapResult<()> {
        if self.is_allocated() {
            return Err(self.rejected(MapError::AlreadyAllocated {
                state: self.state(),
                rejected: buffer,
            }));
        }

        debug!(buffer = %buffer.id(), len = buffer.len(), "buffer allocated");
        self.slot = Slot::Allocated(buffer);
        Ok(())
    }

    /// Enqueue a map of the allocation on `queue`.
    ///
    /// If `blocking` is true the mapping is ready when this returns.
    /// Otherwise the address is stored right away but it is the caller's
    /// responsibility to flush the queue and wait for the map to complete
    /// before using it; [`data`](Self::data) reports
    /// [`MapError::MappingPending`] until then.
    pub fn map<Q>(&mut self, queue: &Q, blocking: bool) -> MapResult<MappedView<'_, T>>
    where
        Q: DeviceQueue + ?Sized,
    {
        let buffer = match mem::take(&mut self.slot) {
            Slot::Allocated(buffer) => buffer,
            other => {
                self.slot = other;
                return Err(self.rejected(MapError::InvalidState {
                    op: Operation::Map,
                    state: self.state(),
                }));
            }
        };

        let mapping = match queue.submit_map(&buffer, blocking) {
            Ok(mapping) => mapping,
            Err(source) => {
                self.slot = Slot::Allocated(buffer);
                return Err(self.rejected(MapError::Backend {
                    op: Operation::Map,
                    state: BufferState::Allocated,
                    source,
                }));
            }
        };

        let (host, fence, owner) = mapping.into_parts();
        debug_assert!(
            !blocking || fence.is_signaled(),
            "blocking map returned before completion"
        );
        debug!(
            buffer = %buffer.id(),
            blocking,
            ready = fence.is_signaled(),
            "buffer mapped"
        );
        self.slot = Slot::Mapped {
            buffer,
            host,
            fence,
            owner,
        };
        Ok(MappedView { handle: self })
    }

    /// Map and wait for completion
    pub fn map_blocking<Q>(&mut self, queue: &Q) -> MapResult<MappedView<'_, T>>
    where
        Q: DeviceQueue + ?Sized,
    {
        self.map(queue, true)
    }

    /// Enqueue an unmap on `queue`.
    ///
    /// The host address is forgotten immediately. The unmap itself is only
    /// enqueued: the caller must make sure the queue has executed it before
    /// device-side work touches the buffer again.
    pub fn unmap<Q>(&mut self, queue: &Q) -> MapResult<()>
    where
        Q: DeviceQueue + ?Sized,
    {
        let (buffer, host, fence, owner) = match mem::take(&mut self.slot) {
            Slot::Mapped {
                buffer,
                host,
                fence,
                owner,
            } => (buffer, host, fence, owner),
            other => {
                self.slot = other;
                return Err(self.rejected(MapError::InvalidState {
                    op: Operation::Unmap,
                    state: self.state(),
                }));
            }
        };

        if let Err(source) = queue.submit_unmap(&buffer, host) {
            self.slot = Slot::Mapped {
                buffer,
                host,
                fence,
                owner,
            };
            return Err(self.rejected(MapError::Backend {
                op: Operation::Unmap,
                state: BufferState::Mapped,
                source,
            }));
        }

        debug!(buffer = %buffer.id(), "buffer unmapped");
        self.slot = Slot::Allocated(buffer);
        Ok(())
    }

    /// Detach the device allocation and hand it back for release
    pub fn free(&mut self) -> MapResult<DeviceBuffer> {
        match mem::take(&mut self.slot) {
            Slot::Allocated(buffer) => {
                debug!(buffer = %buffer.id(), "buffer freed");
                Ok(buffer)
            }
            Slot::Unallocated => Err(self.rejected(MapError::NotAllocated {
                op: Operation::Free,
                state: BufferState::Unallocated,
            })),
            mapped => {
                self.slot = mapped;
                Err(self.rejected(MapError::BufferStillMapped {
                    state: BufferState::Mapped,
                }))
            }
        }
    }

    /// Host address as `*const T`; null unless mapped.
    ///
    /// After a non-blocking map the address is non-null before the mapping
    /// has completed. Dereferencing it before waiting is the caller's bug.
    pub fn as_ptr(&self) -> *const T {
        match &self.slot {
            Slot::Mapped { host, .. } => host.cast::<T>().as_ptr() as *const T,
            _ => ptr::null(),
        }
    }

    /// Host address as `*mut T`; null unless mapped
    pub fn as_mut_ptr(&mut self) -> *mut T {
        match &self.slot {
            Slot::Mapped { host, .. } => host.cast::<T>().as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    /// Completion fence of the current mapping
    pub fn fence(&self) -> Option<&MapFence> {
        match &self.slot {
            Slot::Mapped { fence, .. } => Some(fence),
            _ => None,
        }
    }

    /// Whether the buffer is mapped and the map command has completed
    pub fn is_ready(&self) -> bool {
        self.fence().is_some_and(MapFence::is_signaled)
    }

    /// Typed view of the mapped region.
    ///
    /// Never blocks: fails with [`MapError::MappingPending`] while a
    /// non-blocking map is in flight, and [`MapError::InvalidState`] when not
    /// mapped.
    pub fn data(&self) -> MapResult<&[T]> {
        let (host, len) = self.ready_region()?;
        // Safety: the region is mapped, its map command has completed, and
        // the queue guarantees `len` bytes at `host` until unmap, which needs
        // `&mut self`.
        let bytes = unsafe { slice::from_raw_parts(host.as_ptr(), len) };
        bytemuck::try_cast_slice(bytes).map_err(|reason| layout_error::<T>(reason))
    }

    /// Mutable typed view of the mapped region
    pub fn data_mut(&mut self) -> MapResult<&mut [T]> {
        let (host, len) = self.ready_region()?;
        // Safety: as in `data`, and `&mut self` makes this the only view.
        let bytes = unsafe { slice::from_raw_parts_mut(host.as_ptr(), len) };
        bytemuck::try_cast_slice_mut(bytes).map_err(|reason| layout_error::<T>(reason))
    }

    /// Move the allocation and mapping into a new handle, leaving this one
    /// unallocated
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Host address and byte length of a completed mapping, trimmed to whole
    /// elements
    fn ready_region(&self) -> MapResult<(NonNull<u8>, usize)> {
        match &self.slot {
            Slot::Mapped {
                buffer,
                host,
                fence,
                ..
            } => {
                if !fence.is_signaled() {
                    return Err(MapError::MappingPending {
                        op: Operation::Access,
                        state: BufferState::Mapped,
                    });
                }
                let len = element_count::<T>(buffer.len()) * mem::size_of::<T>();
                Ok((*host, len))
            }
            other => Err(MapError::InvalidState {
                op: Operation::Access,
                state: other.state(),
            }),
        }
    }

    fn rejected(&self, err: MapError) -> MapError {
        warn!(state = %self.state(), error = %err, "buffer operation rejected");
        err
    }
}

fn element_count<T>(bytes: usize) -> usize {
    match mem::size_of::<T>() {
        0 => 0,
        size => bytes / size,
    }
}

fn layout_error<T>(reason: bytemuck::PodCastError) -> MapError {
    MapError::Layout {
        op: Operation::Access,
        state: BufferState::Mapped,
        ty: std::any::type_name::<T>(),
        reason,
    }
}

impl<T> Default for MappedBuffer<T> {
    fn default() -> Self {
        Self {
            slot: Slot::Unallocated,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for MappedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("MappedBuffer");
        s.field("state", &self.slot.state());
        if let Some(buffer) = self.slot.buffer() {
            s.field("buffer", &buffer.id()).field("bytes", &buffer.len());
        }
        if let Slot::Mapped { fence, .. } = &self.slot {
            s.field("ready", &fence.is_signaled());
        }
        s.finish()
    }
}

impl<T> Drop for MappedBuffer<T> {
    fn drop(&mut self) {
        if let Slot::Mapped { buffer, .. } = &self.slot {
            warn!(buffer = %buffer.id(), "mapped buffer dropped without unmap");
        }
    }
}

/// Typed access to a freshly mapped buffer.
///
/// Borrows the handle, so the buffer cannot be unmapped or freed while the
/// view is alive.
pub struct MappedView<'a, T: Pod> {
    handle: &'a mut MappedBuffer<T>,
}

impl<'a, T: Pod> MappedView<'a, T> {
    /// See [`MappedBuffer::as_ptr`]
    pub fn as_ptr(&self) -> *const T {
        self.handle.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.handle.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// Block until the map command has completed.
    ///
    /// Only needed after a non-blocking map; this is the caller-driven
    /// synchronization the handle never performs on its own.
    pub fn wait(&self) {
        if let Some(fence) = self.handle.fence() {
            fence.wait();
        }
    }

    pub fn data(&self) -> MapResult<&[T]> {
        self.handle.data()
    }

    pub fn data_mut(&mut self) -> MapResult<&mut [T]> {
        self.handle.data_mut()
    }
}

impl<T: Pod> fmt::Debug for MappedView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedView")
            .field("len", &self.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}
