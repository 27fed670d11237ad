//! Mapped Buffers
//!
//! A [`MappedBuffer`] owns one device allocation and tracks whether it is
//! currently visible to the host. It moves through three states:
//!
//! ```text
//!              allocate              map
//! Unallocated ─────────► Allocated ─────────► Mapped
//!      ▲                  │     ▲                │
//!      └──────────────────┘     └────────────────┘
//!              free                  unmap
//! ```
//!
//! Operations called out of sequence fail with a [`MapError`] and leave the
//! handle untouched. Nothing is submitted to the device queue in that case.
//!
//! # Example
//!
//! ```
//! use devmap::buffer::MappedBuffer;
//! use devmap::queue::{BufferId, DeviceBuffer, ManualQueue};
//!
//! let queue = ManualQueue::new();
//! let mut handle: MappedBuffer<f32> = MappedBuffer::new();
//! handle.allocate(DeviceBuffer::new(BufferId(1), 16)).unwrap();
//!
//! let mut view = handle.map(&queue, true).unwrap();
//! view.data_mut().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
//!
//! handle.unmap(&queue).unwrap();
//! assert!(handle.as_ptr().is_null());
//! let buffer = handle.free().unwrap();
//! assert_eq!(buffer.len(), 16);
//! ```

mod error;
mod handle;
mod state;

pub use error::{MapError, MapResult};
pub use handle::{MappedBuffer, MappedView};
pub use state::{BufferState, Operation};
