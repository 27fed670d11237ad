//! Devmap - Host mapping of device buffers
//!
//! Accelerator memory is not directly addressable by host code. To read or
//! write it the host asks the device's command queue to *map* the buffer into
//! its address space, works on the returned address, then *unmaps* it so the
//! device can use the memory again.
//!
//! # Features
//!
//! - **Explicit lifecycle**: Unallocated, Allocated and Mapped states with
//!   every out-of-sequence call rejected before reaching the device
//! - **Blocking and non-blocking maps**: non-blocking maps return at once and
//!   report the mapping as pending until the queue has completed it
//! - **Typed access**: mapped regions are viewed as slices of any
//!   `bytemuck::Pod` element type
//! - **Pluggable queues**: anything implementing [`DeviceQueue`] can back a
//!   handle; a simulated host device is included
//!
//! # Example
//!
//! ```rust
//! use devmap::{HostDevice, MappedBuffer};
//!
//! let device = HostDevice::new();
//! let queue = device.queue().unwrap();
//!
//! let mut handle: MappedBuffer<u32> = MappedBuffer::new();
//! handle.allocate(device.allocate(64).unwrap()).unwrap();
//!
//! let mut view = handle.map(&queue, true).unwrap();
//! view.data_mut().unwrap().fill(7);
//! handle.unmap(&queue).unwrap();
//! queue.finish().unwrap();
//!
//! let buffer = handle.free().unwrap();
//! assert_eq!(device.read_device(&buffer).unwrap()[..4], 7u32.to_ne_bytes());
//! device.release(buffer).unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MappedBuffer   │  state machine, typed host view
//! └────────┬────────┘
//!          │ submit_map / submit_unmap
//!          ▼
//! ┌─────────────────┐
//! │  DeviceQueue    │  HostQueue, ManualQueue, or a real driver
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Device memory  │
//! └─────────────────┘
//! ```

#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod queue;

pub use buffer::{BufferState, MapError, MapResult, MappedBuffer, MappedView, Operation};
pub use config::{ConfigError, ConfigResult, DevmapConfig};
pub use queue::{
    BackendError, BackendResult, BufferId, DeviceBuffer, DeviceQueue, HostDevice, HostQueue,
    ManualQueue, MapFence, Mapping,
};

/// Version of the devmap crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
