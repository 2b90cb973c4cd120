//! A binary-buddy heap over a single reserved arena.
//!
//! The arena is one contiguous region of `2^MAX_ORDER` bytes, reserved once
//! when the allocator is constructed and never grown. It is carved into
//! power-of-two blocks of orders `MIN_ORDER..=MAX_ORDER`; each block starts
//! with a small header recording whether it is occupied and its order, so a
//! handle returned by [`BuddyAllocator::allocate`] leads straight back to its
//! block on deallocation.
//!
//! ```
//! use buddy_heap::{BuddyAllocator, Global};
//!
//! // Blocks of 32 bytes up to a single 4 KiB arena.
//! let mut heap = BuddyAllocator::<5, 12, Global>::try_new().unwrap();
//!
//! let handle = heap.allocate(100).unwrap();
//! assert_eq!(heap.usable_size(handle), Ok(128 - buddy_heap::HEADER_SIZE));
//!
//! heap.deallocate(handle).unwrap();
//! heap.check_free_lists();
//! ```
//!
//! A process-wide heap with the default 1 GiB arena is available in the
//! [`global`] module when the `mmap` and `alloc` features are enabled.

#![doc(html_root_url = "https://docs.rs/buddy_heap/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// `sptr` provides methods which shadow their now-inherent counterparts.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod free_list;
mod header;
mod inspect;
mod order;

#[cfg(all(unix, feature = "mmap"))]
mod mmap;

#[cfg(all(unix, feature = "mmap", feature = "alloc"))]
#[cfg_attr(docs_rs, doc(cfg(all(unix, feature = "mmap", feature = "alloc"))))]
pub mod global;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    buddy::BuddyAllocator,
    header::HEADER_SIZE,
    inspect::{FreeBlocks, HeapStats},
    order::{DEFAULT_MAX_ORDER, DEFAULT_MIN_ORDER},
};

#[cfg(all(unix, feature = "mmap"))]
pub use crate::{buddy::DefaultHeap, mmap::Mmap};

/// Indicates an allocation failure due to resource exhaustion or an
/// unsupported request size.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free block is large enough to satisfy the request")
    }
}

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to reserve
    /// memory, either for metadata or the arena, but the backing source
    /// fails.
    ///
    /// The variant contains the [`Layout`] that could not be reserved.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's order parameters are
    /// impossible to satisfy.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to reserve {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}

/// The error type for [`BuddyAllocator::deallocate`].
///
/// A rejected handle leaves the allocator untouched.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DeallocError {
    /// The handle does not point into the arena.
    OutOfBounds,

    /// The handle is not positioned where a block's payload could begin.
    Misaligned,

    /// No occupied block starts at the handle's position.
    ///
    /// This is returned for double frees.
    NotAllocated,
}

impl fmt::Display for DeallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeallocError::OutOfBounds => "handle does not point into the arena",
            DeallocError::Misaligned => "handle is not aligned to a block boundary",
            DeallocError::NotAllocated => "handle does not refer to an occupied block",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

#[cfg(feature = "std")]
impl std::error::Error for DeallocError {}

/// Types which provide memory which backs an allocator.
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by
///   another allocator. This is the case when constructing the allocator from
///   raw pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
/// - The `Mmap` marker type indicates that the arena was reserved directly
///   from the operating system. The allocator unmaps its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Releases the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a region of memory currently reserved via this
    ///   backing source, and
    /// * `layout` must be the layout that region was reserved with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
