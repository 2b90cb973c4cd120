//! The process-wide heap.
//!
//! The first call into this module reserves a [`DefaultHeap`]: a 1 GiB
//! arena carved into blocks of 32 bytes and up. The arena is never released.
//!
//! The heap is guarded by a spinlock so that the static is sound, but it is
//! meant for single-threaded use; every call holds the lock for the whole
//! operation.
//!
//! ```
//! let handle = buddy_heap::global::allocate(24);
//! unsafe { handle.as_ptr().write_bytes(0, 24) };
//! buddy_heap::global::deallocate(handle).unwrap();
//! ```

use core::{alloc::Layout, fmt, ptr::NonNull};

use spin::Mutex;

use crate::{AllocError, AllocInitError, DeallocError, DefaultHeap, HEADER_SIZE};

static HEAP: Mutex<Option<DefaultHeap>> = Mutex::new(None);

/// Runs `f` on the process-wide heap, reserving it first if needed.
///
/// A failed reservation is fatal.
fn with_heap<R>(f: impl FnOnce(&mut DefaultHeap) -> R) -> R {
    let mut guard = HEAP.lock();

    let heap = match &mut *guard {
        Some(heap) => heap,
        slot @ None => slot.insert(reserve()),
    };

    f(heap)
}

fn reserve() -> DefaultHeap {
    match DefaultHeap::try_new_mmap() {
        Ok(heap) => heap,
        Err(AllocInitError::AllocFailed(layout)) => {
            log::error!("failed to reserve the process-wide arena");
            alloc::alloc::handle_alloc_error(layout)
        }
        Err(e) => panic!("process-wide heap misconfigured: {e}"),
    }
}

/// Allocates a block with room for `size` bytes from the process-wide heap.
///
/// Exhausting the arena is fatal: the process is terminated through
/// [`handle_alloc_error`](alloc::alloc::handle_alloc_error). Use
/// [`try_allocate`] to handle exhaustion instead.
pub fn allocate(size: usize) -> NonNull<u8> {
    match try_allocate(size) {
        Ok(handle) => handle,
        Err(AllocError) => {
            log::error!("process-wide heap cannot satisfy a request for {size} bytes");

            let layout = Layout::from_size_align(size, HEADER_SIZE)
                .unwrap_or_else(|_| Layout::new::<[u8; HEADER_SIZE]>());
            alloc::alloc::handle_alloc_error(layout)
        }
    }
}

/// Allocates a block with room for `size` bytes from the process-wide heap.
///
/// # Errors
///
/// Returns `Err` if `size` is zero or no free block is large enough.
pub fn try_allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    with_heap(|heap| heap.allocate(size))
}

/// Returns the block behind `handle` to the process-wide heap.
///
/// # Errors
///
/// Returns `Err` without modifying the heap if `handle` was not returned by
/// [`allocate`] or [`try_allocate`], or has already been deallocated.
pub fn deallocate(handle: NonNull<u8>) -> Result<(), DeallocError> {
    with_heap(|heap| heap.deallocate(handle))
}

/// Writes a listing of the process-wide heap's free lists to `w`.
///
/// See [`BuddyAllocator::dump_heap`](crate::BuddyAllocator::dump_heap) for
/// the format.
///
/// # Errors
///
/// Returns any error produced by `w`.
pub fn dump_heap<W: fmt::Write>(w: &mut W) -> fmt::Result {
    with_heap(|heap| {
        heap.check_free_lists();
        heap.dump_heap(w)
    })
}
