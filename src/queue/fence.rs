//! Completion fence for map commands

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

struct FenceInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Completion signal of one submitted map command.
///
/// Clones share the same signal. Once signaled a fence stays signaled.
#[derive(Clone)]
pub struct MapFence {
    inner: Arc<FenceInner>,
}

impl MapFence {
    /// Create an unsignaled fence
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a fence that is already signaled
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    /// Mark the command as complete and wake every waiter
    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_all();
    }

    /// Poll the fence without blocking
    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Block the calling thread until the fence is signaled
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.cond.wait(&mut signaled);
        }
    }
}

impl Default for MapFence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MapFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapFence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_fence_is_unsignaled() {
        let fence = MapFence::new();
        assert!(!fence.is_signaled());
        assert!(MapFence::signaled().is_signaled());
    }

    #[test]
    fn test_clones_share_signal() {
        let fence = MapFence::new();
        let clone = fence.clone();
        clone.signal();
        assert!(fence.is_signaled());
        // Waiting on a signaled fence returns immediately
        fence.wait();
    }

    #[test]
    fn test_wait_wakes_on_signal() {
        let fence = MapFence::new();
        let remote = fence.clone();

        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal();
        });

        fence.wait();
        assert!(fence.is_signaled());
        signaler.join().unwrap();
    }
}
