//! Host-memory device backend
//!
//! [`HostDevice`] stands in for an accelerator whose memory is a set of
//! anonymous memory maps. [`HostQueue`] is an in-order command queue on that
//! device: commands are validated and enqueued on the caller's thread and
//! completed by a worker thread after a configurable latency, so the
//! blocking and non-blocking mapping modes behave like they do on real
//! hardware.

use super::{
    BackendError, BackendResult, BufferId, DeviceBuffer, DeviceQueue, MapFence, Mapping,
    MappingOwner,
};
use crate::config::QueueConfig;
use crossbeam_channel::{unbounded, Receiver, Sender};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One live device allocation
struct Allocation {
    memory: MmapMut,
    /// Address of `memory`, handed out as the mapping address
    base: NonNull<u8>,
    /// Device-side view: true between an enqueued map and an enqueued unmap
    mapped: bool,
    /// Bumped on every map, so a mapping guard only ever clears its own map
    generation: u64,
}

// Safety: `base` points into `memory`, which the allocation owns
unsafe impl Send for Allocation {}

struct DeviceInner {
    next_id: AtomicU64,
    allocations: Mutex<HashMap<BufferId, Allocation>>,
}

impl DeviceInner {
    fn begin_map(&self, buffer: &DeviceBuffer) -> BackendResult<(NonNull<u8>, u64)> {
        let id = buffer.id();
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&id)
            .ok_or(BackendError::UnknownBuffer(id))?;
        if allocation.mapped {
            return Err(BackendError::AlreadyMapped(id));
        }
        if buffer.len() > allocation.memory.len() {
            return Err(BackendError::Rejected(format!(
                "{} claims {} bytes but the allocation holds {}",
                id,
                buffer.len(),
                allocation.memory.len()
            )));
        }
        allocation.mapped = true;
        allocation.generation += 1;
        Ok((allocation.base, allocation.generation))
    }

    fn begin_unmap(&self, id: BufferId, host_ptr: NonNull<u8>) -> BackendResult<()> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&id)
            .ok_or(BackendError::UnknownBuffer(id))?;
        if !allocation.mapped {
            return Err(BackendError::NotMapped(id));
        }
        if allocation.base != host_ptr {
            return Err(BackendError::Rejected(format!(
                "{} is mapped at {:p}, not {:p}",
                id,
                allocation.base.as_ptr(),
                host_ptr.as_ptr()
            )));
        }
        allocation.mapped = false;
        Ok(())
    }

    /// Undo `begin_map`/`begin_unmap` when the command never reached the queue
    fn set_mapped(&self, id: BufferId, mapped: bool) {
        if let Some(allocation) = self.allocations.lock().get_mut(&id) {
            allocation.mapped = mapped;
        }
    }

    /// Drop the device-side mapping left behind by a mapping that was never
    /// unmapped. A later map of the same buffer has a newer generation and
    /// is left alone.
    fn abandon_map(&self, id: BufferId, generation: u64) {
        if let Some(allocation) = self.allocations.lock().get_mut(&id) {
            if allocation.mapped && allocation.generation == generation {
                allocation.mapped = false;
                warn!(buffer = %id, "mapping dropped without unmap, device mapping released");
            }
        }
    }

    /// Run `f` on an allocation that is not host-mapped
    fn with_unmapped<R>(
        &self,
        id: BufferId,
        f: impl FnOnce(&mut MmapMut) -> BackendResult<R>,
    ) -> BackendResult<R> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&id)
            .ok_or(BackendError::UnknownBuffer(id))?;
        if allocation.mapped {
            return Err(BackendError::AlreadyMapped(id));
        }
        f(&mut allocation.memory)
    }
}

/// Keep-alive attached to every mapping handed out by a [`HostQueue`].
///
/// Holds the device memory alive while the host address is in use. If the
/// mapping goes away without an unmap (its handle was dropped while mapped),
/// the device-side mapping is released so the allocation can be used and
/// released again.
struct MappingGuard {
    device: Arc<DeviceInner>,
    buffer: BufferId,
    generation: u64,
}

impl Drop for MappingGuard {
    fn drop(&mut self) {
        self.device.abandon_map(self.buffer, self.generation);
    }
}

/// Simulated device owning host-backed allocations.
///
/// Clones refer to the same device.
#[derive(Clone)]
pub struct HostDevice {
    inner: Arc<DeviceInner>,
}

impl HostDevice {
    /// Create a device with no allocations
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                next_id: AtomicU64::new(1),
                allocations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate `len` zeroed bytes of device memory
    pub fn allocate(&self, len: usize) -> BackendResult<DeviceBuffer> {
        if len == 0 {
            return Err(BackendError::Rejected("zero-length allocation".into()));
        }

        let mut memory = MmapMut::map_anon(len)
            .map_err(|source| BackendError::Allocation { size: len, source })?;
        let base = NonNull::new(memory.as_mut_ptr())
            .ok_or_else(|| BackendError::Rejected("anonymous map returned null".into()))?;

        let id = BufferId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.allocations.lock().insert(
            id,
            Allocation {
                memory,
                base,
                mapped: false,
                generation: 0,
            },
        );

        debug!(buffer = %id, len, "allocated device buffer");
        Ok(DeviceBuffer::new(id, len))
    }

    /// Release an allocation. Mapped allocations cannot be released.
    pub fn release(&self, buffer: DeviceBuffer) -> BackendResult<()> {
        let id = buffer.id();
        let mut allocations = self.inner.allocations.lock();
        let mapped = allocations
            .get(&id)
            .map(|allocation| allocation.mapped)
            .ok_or(BackendError::UnknownBuffer(id))?;
        if mapped {
            return Err(BackendError::AlreadyMapped(id));
        }
        allocations.remove(&id);
        debug!(buffer = %id, "released device buffer");
        Ok(())
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.inner.allocations.lock().len()
    }

    /// Whether the device considers `buffer` mapped (as of the last enqueued command)
    pub fn is_mapped(&self, buffer: &DeviceBuffer) -> BackendResult<bool> {
        self.inner
            .allocations
            .lock()
            .get(&buffer.id())
            .map(|allocation| allocation.mapped)
            .ok_or(BackendError::UnknownBuffer(buffer.id()))
    }

    /// Copy the buffer contents the way a device kernel would see them.
    ///
    /// Fails while the buffer is mapped. Drain the queue first so enqueued
    /// unmaps have completed.
    pub fn read_device(&self, buffer: &DeviceBuffer) -> BackendResult<Vec<u8>> {
        self.inner
            .with_unmapped(buffer.id(), |memory| Ok(memory.to_vec()))
    }

    /// Overwrite part of the buffer from the device side
    pub fn write_device(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        data: &[u8],
    ) -> BackendResult<()> {
        self.inner.with_unmapped(buffer.id(), |memory| {
            let end = offset
                .checked_add(data.len())
                .filter(|&end| end <= memory.len())
                .ok_or_else(|| {
                    BackendError::Rejected(format!(
                        "write of {} bytes at offset {} exceeds {} byte buffer",
                        data.len(),
                        offset,
                        memory.len()
                    ))
                })?;
            memory[offset..end].copy_from_slice(data);
            Ok(())
        })
    }

    /// Create a queue with default settings
    pub fn queue(&self) -> BackendResult<HostQueue> {
        self.queue_with(&QueueConfig::default())
    }

    /// Create a queue with custom settings
    pub fn queue_with(&self, config: &QueueConfig) -> BackendResult<HostQueue> {
        HostQueue::spawn(Arc::clone(&self.inner), config)
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Map { buffer: BufferId, fence: MapFence },
    Unmap { buffer: BufferId },
    Finish(MapFence),
}

/// Queue statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub maps_submitted: u64,
    pub maps_completed: u64,
    pub unmaps_submitted: u64,
    pub unmaps_completed: u64,
}

#[derive(Default)]
struct Counters {
    maps_submitted: AtomicU64,
    maps_completed: AtomicU64,
    unmaps_submitted: AtomicU64,
    unmaps_completed: AtomicU64,
}

/// In-order command queue on a [`HostDevice`].
///
/// Dropping the queue completes every command already enqueued, then stops
/// the worker thread.
pub struct HostQueue {
    device: Arc<DeviceInner>,
    label: String,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl HostQueue {
    fn spawn(device: Arc<DeviceInner>, config: &QueueConfig) -> BackendResult<Self> {
        let (sender, receiver) = unbounded();
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let map_latency = config.map_latency();
        let unmap_latency = config.unmap_latency();
        let worker = thread::Builder::new()
            .name(config.label.clone())
            .spawn(move || run_worker(receiver, map_latency, unmap_latency, &worker_counters))
            .map_err(BackendError::Spawn)?;

        debug!(queue = %config.label, ?map_latency, ?unmap_latency, "host queue started");
        Ok(Self {
            device,
            label: config.label.clone(),
            sender: Some(sender),
            worker: Some(worker),
            counters,
        })
    }

    /// Queue label (also the worker thread name)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until every command enqueued so far has completed.
    ///
    /// This is the synchronization point for non-blocking maps and for
    /// unmaps before device-side access.
    pub fn finish(&self) -> BackendResult<()> {
        let fence = MapFence::new();
        self.send(Command::Finish(fence.clone()))?;
        fence.wait();
        Ok(())
    }

    /// Snapshot of submission and completion counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            maps_submitted: self.counters.maps_submitted.load(Ordering::Relaxed),
            maps_completed: self.counters.maps_completed.load(Ordering::Relaxed),
            unmaps_submitted: self.counters.unmaps_submitted.load(Ordering::Relaxed),
            unmaps_completed: self.counters.unmaps_completed.load(Ordering::Relaxed),
        }
    }

    fn send(&self, command: Command) -> BackendResult<()> {
        self.sender
            .as_ref()
            .ok_or(BackendError::Disconnected)?
            .send(command)
            .map_err(|_| BackendError::Disconnected)
    }
}

// Safety: mapped allocations cannot be read, written or released through the
// device until unmapped, and every mapping holds the device memory alive.
unsafe impl DeviceQueue for HostQueue {
    fn submit_map(&self, buffer: &DeviceBuffer, blocking: bool) -> BackendResult<Mapping> {
        let id = buffer.id();
        let (base, generation) = self.device.begin_map(buffer)?;

        let fence = MapFence::new();
        if let Err(err) = self.send(Command::Map {
            buffer: id,
            fence: fence.clone(),
        }) {
            self.device.set_mapped(id, false);
            return Err(err);
        }
        self.counters.maps_submitted.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.label, buffer = %id, blocking, "map enqueued");

        if blocking {
            fence.wait();
        }
        let owner: MappingOwner = Arc::new(MappingGuard {
            device: Arc::clone(&self.device),
            buffer: id,
            generation,
        });
        Ok(Mapping::new(base, fence).with_owner(owner))
    }

    fn submit_unmap(&self, buffer: &DeviceBuffer, host_ptr: NonNull<u8>) -> BackendResult<()> {
        let id = buffer.id();
        self.device.begin_unmap(id, host_ptr)?;

        if let Err(err) = self.send(Command::Unmap { buffer: id }) {
            self.device.set_mapped(id, true);
            return Err(err);
        }
        self.counters.unmaps_submitted.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.label, buffer = %id, "unmap enqueued");
        Ok(())
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(queue = %self.label, "queue worker panicked");
            }
        }
    }
}

fn run_worker(
    receiver: Receiver<Command>,
    map_latency: Duration,
    unmap_latency: Duration,
    counters: &Counters,
) {
    for command in receiver.iter() {
        match command {
            Command::Map { buffer, fence } => {
                if !map_latency.is_zero() {
                    thread::sleep(map_latency);
                }
                counters.maps_completed.fetch_add(1, Ordering::Relaxed);
                fence.signal();
                trace!(buffer = %buffer, "map complete");
            }
            Command::Unmap { buffer } => {
                if !unmap_latency.is_zero() {
                    thread::sleep(unmap_latency);
                }
                counters.unmaps_completed.fetch_add(1, Ordering::Relaxed);
                trace!(buffer = %buffer, "unmap complete");
            }
            Command::Finish(fence) => fence.signal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_queue(device: &HostDevice, map_ms: u64) -> HostQueue {
        let config = QueueConfig {
            map_latency_us: map_ms * 1000,
            ..QueueConfig::default()
        };
        device.queue_with(&config).unwrap()
    }

    #[test]
    fn test_allocate_and_release() {
        let device = HostDevice::new();
        let a = device.allocate(64).unwrap();
        let b = device.allocate(64).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(device.allocation_count(), 2);

        device.release(a).unwrap();
        assert_eq!(device.allocation_count(), 1);
        assert_eq!(device.read_device(&b).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn test_zero_length_allocation_rejected() {
        let device = HostDevice::new();
        assert!(matches!(
            device.allocate(0),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn test_blocking_map_is_complete_on_return() {
        let device = HostDevice::new();
        let queue = slow_queue(&device, 10);
        let buffer = device.allocate(16).unwrap();

        let mapping = queue.submit_map(&buffer, true).unwrap();
        assert!(mapping.fence().is_signaled());
        assert_eq!(queue.stats().maps_completed, 1);
    }

    #[test]
    fn test_non_blocking_map_completes_later() {
        let device = HostDevice::new();
        let queue = slow_queue(&device, 500);
        let buffer = device.allocate(16).unwrap();

        let mapping = queue.submit_map(&buffer, false).unwrap();
        assert!(!mapping.fence().is_signaled());
        assert_eq!(queue.stats().maps_completed, 0);

        queue.finish().unwrap();
        assert!(mapping.fence().is_signaled());
    }

    #[test]
    fn test_device_rejects_double_map() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(16).unwrap();

        let _mapping = queue.submit_map(&buffer, true).unwrap();
        assert!(matches!(
            queue.submit_map(&buffer, true),
            Err(BackendError::AlreadyMapped(_))
        ));
    }

    #[test]
    fn test_unmap_requires_matching_address() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(16).unwrap();

        let mapping = queue.submit_map(&buffer, true).unwrap();
        let wrong = NonNull::<u64>::dangling().cast::<u8>();
        assert!(matches!(
            queue.submit_unmap(&buffer, wrong),
            Err(BackendError::Rejected(_))
        ));

        queue.submit_unmap(&buffer, mapping.ptr()).unwrap();
        assert!(matches!(
            queue.submit_unmap(&buffer, mapping.ptr()),
            Err(BackendError::NotMapped(_))
        ));
    }

    #[test]
    fn test_device_access_requires_unmapped_buffer() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(8).unwrap();

        device.write_device(&buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert!(device.write_device(&buffer, 6, &[0; 4]).is_err());

        let mapping = queue.submit_map(&buffer, true).unwrap();
        assert!(matches!(
            device.read_device(&buffer),
            Err(BackendError::AlreadyMapped(_))
        ));

        queue.submit_unmap(&buffer, mapping.ptr()).unwrap();
        queue.finish().unwrap();
        assert_eq!(
            device.read_device(&buffer).unwrap(),
            vec![0u8, 0, 0, 0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_oversized_token_rejected() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(16).unwrap();
        let forged = DeviceBuffer::new(buffer.id(), 1 << 20);

        assert!(matches!(
            queue.submit_map(&forged, true),
            Err(BackendError::Rejected(_))
        ));
        assert!(!device.is_mapped(&buffer).unwrap());
    }

    #[test]
    fn test_mapping_keeps_device_memory_alive() {
        let queue;
        let mapping;
        {
            let device = HostDevice::new();
            queue = device.queue().unwrap();
            let buffer = device.allocate(8).unwrap();
            mapping = queue.submit_map(&buffer, true).unwrap();
        }
        let (ptr, _fence, owner) = mapping.into_parts();
        assert!(owner.is_some());
        // Safety: the owner keeps the allocation alive and nothing else touches it
        unsafe {
            ptr.as_ptr().write(7);
            assert_eq!(ptr.as_ptr().read(), 7);
        }
        drop(queue);
    }

    #[test]
    fn test_dropped_mapping_releases_device_mapping() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(8).unwrap();

        let mapping = queue.submit_map(&buffer, true).unwrap();
        assert!(device.is_mapped(&buffer).unwrap());
        drop(mapping);

        assert!(!device.is_mapped(&buffer).unwrap());
        device.release(buffer).unwrap();
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn test_stale_mapping_leaves_newer_map_alone() {
        let device = HostDevice::new();
        let queue = device.queue().unwrap();
        let buffer = device.allocate(8).unwrap();

        let first = queue.submit_map(&buffer, true).unwrap();
        queue.submit_unmap(&buffer, first.ptr()).unwrap();
        let _second = queue.submit_map(&buffer, true).unwrap();

        drop(first);
        assert!(device.is_mapped(&buffer).unwrap());
    }

    #[test]
    fn test_drop_drains_pending_commands() {
        let device = HostDevice::new();
        let buffer = device.allocate(8).unwrap();
        let fence = {
            let queue = slow_queue(&device, 20);
            let mapping = queue.submit_map(&buffer, false).unwrap();
            mapping.fence().clone()
        };
        assert!(fence.is_signaled());
    }
}
