//! Manually completed queue
//!
//! Test double for code that drives [`DeviceQueue`] implementations. Blocking
//! maps complete during submission; non-blocking maps stay pending until
//! [`ManualQueue::complete_all`] is called, which models a device that has
//! not yet caught up with its queue.

use super::{
    BackendError, BackendResult, BufferId, DeviceBuffer, DeviceQueue, MapFence, Mapping,
    MappingOwner,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;

/// A command as seen by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Map { buffer: BufferId, blocking: bool },
    Unmap { buffer: BufferId },
}

#[derive(Default)]
struct ManualState {
    /// Host memory per buffer, kept across unmap so contents survive remapping
    regions: HashMap<BufferId, Box<[u64]>>,
    mapped: HashSet<BufferId>,
    pending: Vec<MapFence>,
    submissions: Vec<Submission>,
    fail_next: Option<BackendError>,
}

/// Device queue completed by hand.
///
/// Regions are never freed while any mapping handed out by the queue is
/// alive, even if the queue itself is dropped.
#[derive(Default)]
pub struct ManualQueue {
    state: Arc<Mutex<ManualState>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every pending map fence, returning how many were pending
    pub fn complete_all(&self) -> usize {
        let pending: Vec<MapFence> = self.state.lock().pending.drain(..).collect();
        for fence in &pending {
            fence.signal();
        }
        pending.len()
    }

    /// Number of non-blocking maps not yet completed
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Every command submitted so far, in order
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Make the next submission fail with `error`
    pub fn fail_next(&self, error: BackendError) {
        self.state.lock().fail_next = Some(error);
    }
}

// Safety: regions are only dropped with the shared state, which every mapping
// keeps alive, and the queue never touches region contents itself.
unsafe impl DeviceQueue for ManualQueue {
    fn submit_map(&self, buffer: &DeviceBuffer, blocking: bool) -> BackendResult<Mapping> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if state.mapped.contains(&buffer.id()) {
            return Err(BackendError::AlreadyMapped(buffer.id()));
        }

        let words = buffer.len().div_ceil(8).max(1);
        let region = state
            .regions
            .entry(buffer.id())
            .or_insert_with(|| vec![0u64; words].into_boxed_slice());
        if region.len() < words {
            return Err(BackendError::Rejected(format!(
                "{} grew from {} to {} bytes between maps",
                buffer.id(),
                region.len() * 8,
                buffer.len()
            )));
        }
        let ptr = NonNull::from(&mut region[..]).cast::<u8>();
        state.mapped.insert(buffer.id());

        let fence = if blocking {
            MapFence::signaled()
        } else {
            let fence = MapFence::new();
            state.pending.push(fence.clone());
            fence
        };
        state.submissions.push(Submission::Map {
            buffer: buffer.id(),
            blocking,
        });
        let owner: MappingOwner = self.state.clone();
        Ok(Mapping::new(ptr, fence).with_owner(owner))
    }

    fn submit_unmap(&self, buffer: &DeviceBuffer, _host_ptr: NonNull<u8>) -> BackendResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if !state.mapped.remove(&buffer.id()) {
            return Err(BackendError::NotMapped(buffer.id()));
        }
        state.submissions.push(Submission::Unmap {
            buffer: buffer.id(),
        });
        Ok(())
    }
}
