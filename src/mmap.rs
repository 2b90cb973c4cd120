//! Arena reservation from the operating system.

use core::{alloc::Layout, ptr::NonNull};

use sptr::Strict;

use crate::{AllocInitError, BackingAllocator, Sealed};

/// A marker type indicating that an allocator's memory was reserved with an
/// anonymous private `mmap`.
#[derive(Clone, Debug)]
pub struct Mmap;

impl Sealed for Mmap {}

impl BackingAllocator for Mmap {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { release(ptr, layout) };
    }
}

/// Maps a fresh, zeroed region satisfying `layout`.
pub(crate) fn reserve(layout: Layout) -> Result<NonNull<u8>, AllocInitError> {
    let raw = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            layout.size(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if raw == libc::MAP_FAILED {
        log::debug!("mmap of {} bytes failed", layout.size());
        return Err(AllocInitError::AllocFailed(layout));
    }

    let ptr = NonNull::new(raw.cast::<u8>()).ok_or(AllocInitError::AllocFailed(layout))?;

    // Mappings are page-aligned, which covers every arena alignment short of
    // a page.
    if ptr.as_ptr().addr() % layout.align() != 0 {
        unsafe { release(ptr, layout) };
        return Err(AllocInitError::AllocFailed(layout));
    }

    Ok(ptr)
}

/// Unmaps a region returned by [`reserve`].
///
/// # Safety
///
/// `ptr` must have been returned by `reserve(layout)` and not yet released.
pub(crate) unsafe fn release(ptr: NonNull<u8>, layout: Layout) {
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), layout.size()) };
    debug_assert_eq!(rc, 0, "munmap failed");
}
