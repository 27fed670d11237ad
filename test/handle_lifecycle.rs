//! Mapped-buffer lifecycle tests
//!
//! Drives `MappedBuffer` through its states against a `ManualQueue`, whose
//! non-blocking maps only complete when the test says so.

use bytemuck::{Pod, Zeroable};
use devmap::queue::Submission;
use devmap::{
    BufferId, BufferState, DeviceBuffer, ManualQueue, MapError, MappedBuffer, Operation,
};

fn device_buffer(id: u64, bytes: usize) -> DeviceBuffer {
    DeviceBuffer::new(BufferId(id), bytes)
}

fn allocated<T: Pod>(id: u64, bytes: usize) -> MappedBuffer<T> {
    let mut handle = MappedBuffer::new();
    handle.allocate(device_buffer(id, bytes)).unwrap();
    handle
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Vertex {
    position: [f32; 3],
    color: u32,
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_full_cycle_returns_to_unallocated() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u8> = MappedBuffer::new();
    assert_eq!(handle.state(), BufferState::Unallocated);

    handle.allocate(device_buffer(1, 64)).unwrap();
    assert_eq!(handle.state(), BufferState::Allocated);

    handle.map(&queue, true).unwrap();
    assert_eq!(handle.state(), BufferState::Mapped);

    handle.unmap(&queue).unwrap();
    assert_eq!(handle.state(), BufferState::Allocated);

    let buffer = handle.free().unwrap();
    assert_eq!(buffer.id(), BufferId(1));
    assert_eq!(handle.state(), BufferState::Unallocated);
    assert!(handle.as_ptr().is_null());

    // The same handle can take a new allocation
    handle.allocate(device_buffer(2, 32)).unwrap();
    let view = handle.map(&queue, true).unwrap();
    assert_eq!(view.len(), 32);
    assert!(!view.as_ptr().is_null());
}

#[test]
fn test_mapping_pointer_non_null_only_when_mapped() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u32> = MappedBuffer::new();
    assert!(handle.as_ptr().is_null());

    handle.allocate(device_buffer(1, 16)).unwrap();
    assert!(handle.as_ptr().is_null());

    for blocking in [true, false] {
        handle.map(&queue, blocking).unwrap();
        assert!(!handle.as_ptr().is_null());
        assert!(!handle.as_mut_ptr().is_null());
        handle.unmap(&queue).unwrap();
        assert!(handle.as_ptr().is_null());
    }

    handle.free().unwrap();
    assert!(handle.as_ptr().is_null());
}

#[test]
fn test_remap_cycles_keep_contents() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u32> = allocated(1, 32);

    for round in 0..4u32 {
        let mut view = handle.map(&queue, true).unwrap();
        let data = view.data_mut().unwrap();
        if round > 0 {
            assert!(data.iter().all(|&v| v == round - 1));
        }
        data.fill(round);
        handle.unmap(&queue).unwrap();
    }

    assert_eq!(queue.submissions().len(), 8);
}

// ============================================================================
// Rejected operations
// ============================================================================

#[test]
fn test_rejected_operations_change_nothing() {
    let queue = ManualQueue::new();

    // Unallocated
    let mut handle: MappedBuffer<u8> = MappedBuffer::new();
    assert!(handle.map(&queue, true).is_err());
    assert!(handle.unmap(&queue).is_err());
    assert!(handle.free().is_err());
    assert_eq!(handle.state(), BufferState::Unallocated);

    // Allocated
    handle.allocate(device_buffer(1, 8)).unwrap();
    assert!(handle.unmap(&queue).is_err());
    let err = handle.allocate(device_buffer(2, 8)).unwrap_err();
    assert_eq!(err.operation(), Operation::Allocate);
    assert_eq!(handle.state(), BufferState::Allocated);
    assert_eq!(handle.device_buffer().map(|b| b.id()), Some(BufferId(1)));

    // Mapped
    handle.map(&queue, true).unwrap();
    let ptr = handle.as_ptr();
    assert!(handle.map(&queue, true).is_err());
    assert!(handle.free().is_err());
    assert!(handle.allocate(device_buffer(3, 8)).is_err());
    assert_eq!(handle.state(), BufferState::Mapped);
    assert_eq!(handle.as_ptr(), ptr);

    // Only the one successful map reached the queue
    assert_eq!(
        queue.submissions(),
        vec![Submission::Map {
            buffer: BufferId(1),
            blocking: true
        }]
    );
}

#[test]
fn test_free_while_mapped_reports_still_mapped() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u8> = allocated(1, 8);
    handle.map(&queue, true).unwrap();

    let err = handle.free().unwrap_err();
    assert!(matches!(
        err,
        MapError::BufferStillMapped {
            state: BufferState::Mapped
        }
    ));
    assert!(err.is_precondition());
    assert_eq!(err.operation(), Operation::Free);
}

#[test]
fn test_precondition_errors_name_operation_and_state() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u8> = MappedBuffer::new();

    let err = handle.map(&queue, true).unwrap_err();
    assert_eq!(err.to_string(), "map: not allowed in state unallocated");

    let err = handle.free().unwrap_err();
    assert_eq!(
        err.to_string(),
        "free: buffer is not allocated (state: unallocated)"
    );
}

// ============================================================================
// Blocking and non-blocking maps
// ============================================================================

#[test]
fn test_blocking_map_is_immediately_dereferenceable() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u32> = allocated(1, 16);

    let view = handle.map(&queue, true).unwrap();
    assert!(view.is_ready());
    assert_eq!(view.data().unwrap(), &[0, 0, 0, 0]);
    assert_eq!(queue.pending(), 0);
}

#[test]
fn test_non_blocking_map_pending_until_queue_completes() {
    let queue = ManualQueue::new();
    let mut handle: MappedBuffer<u32> = allocated(1, 16);

    handle.map(&queue, false).unwrap();
    assert_eq!(handle.state(), BufferState::Mapped);
    assert!(!handle.as_ptr().is_null());
    assert!(!handle.is_ready());
    assert!(matches!(
        handle.data_mut(),
        Err(MapError::MappingPending {
            op: Operation::Access,
            state: BufferState::Mapped
        })
    ));

    assert_eq!(queue.complete_all(), 1);
    assert!(handle.is_ready());
    handle.data_mut().unwrap()[0] = 42;
    assert_eq!(handle.data().unwrap()[0], 42);
}

#[test]
fn test_view_wait_blocks_until_completion() {
    let queue = std::sync::Arc::new(ManualQueue::new());
    let mut handle: MappedBuffer<u8> = allocated(1, 8);

    let view = handle.map(queue.as_ref(), false).unwrap();
    let completer = {
        let queue = std::sync::Arc::clone(&queue);
        std::thread::spawn(move || {
            while queue.pending() == 0 {
                std::thread::yield_now();
            }
            queue.complete_all();
        })
    };

    view.wait();
    assert!(view.is_ready());
    completer.join().unwrap();
}

// ============================================================================
// Typed views and ownership
// ============================================================================

#[test]
fn test_pod_struct_view() {
    let queue = ManualQueue::new();
    let bytes = 4 * std::mem::size_of::<Vertex>();
    let mut handle: MappedBuffer<Vertex> = allocated(1, bytes);
    assert_eq!(handle.len(), 4);

    let vertex = Vertex {
        position: [1.0, 2.0, 3.0],
        color: 0xff00ff,
    };
    handle.map(&queue, true).unwrap().data_mut().unwrap()[2] = vertex;
    handle.unmap(&queue).unwrap();

    handle.map(&queue, true).unwrap();
    assert_eq!(handle.data().unwrap()[2], vertex);
    assert_eq!(handle.data().unwrap()[0], Vertex::zeroed());
}

#[test]
fn test_take_moves_mapping() {
    let queue = ManualQueue::new();
    let mut source: MappedBuffer<u16> = allocated(7, 8);
    source.map(&queue, true).unwrap();
    let ptr = source.as_ptr();

    let mut target = source.take();
    assert_eq!(source.state(), BufferState::Unallocated);
    assert!(source.as_ptr().is_null());
    assert!(source.unmap(&queue).is_err());

    assert_eq!(target.state(), BufferState::Mapped);
    assert_eq!(target.as_ptr(), ptr);
    target.unmap(&queue).unwrap();
    assert_eq!(target.free().unwrap().id(), BufferId(7));
}

#[test]
fn test_handle_moves_across_threads() {
    let queue = std::sync::Arc::new(ManualQueue::new());
    let mut handle: MappedBuffer<u64> = allocated(1, 64);
    handle.map(queue.as_ref(), true).unwrap();

    let worker_queue = std::sync::Arc::clone(&queue);
    let handle = std::thread::spawn(move || {
        handle.data_mut().unwrap().fill(9);
        handle.unmap(worker_queue.as_ref()).unwrap();
        handle
    })
    .join()
    .unwrap();

    assert_eq!(handle.state(), BufferState::Allocated);
    assert!(handle.as_ptr().is_null());
}
