//! A binary-buddy memory allocator.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation   | Best-case | Worst-case                      |
//! |-------------|-----------|---------------------------------|
//! | Allocate    | O(1)      | O(levels)                       |
//! | Deallocate  | O(1)      | O(levels × free blocks / level) |
//!
//! Deallocation finds a block's buddy by scanning the free list of its order,
//! so its cost grows with the number of free blocks of that order.
//!
//! #### Fragmentation
//!
//! Every request is rounded up to a power of two after adding the header, so
//! internal fragmentation is at most half of a block. Freed blocks are merged
//! with their buddies as far up as possible, so external fragmentation is
//! limited to free blocks whose buddies are still in use.

use core::{
    alloc::Layout,
    cmp, fmt,
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use crate::{
    base::BasePtr,
    bitmap::Bitmap,
    free_list::FreeLists,
    header::{BlockTag, FREE_BLOCK_SIZE, HEADER_SIZE},
    order, AllocError, AllocInitError, BackingAllocator, DeallocError, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

#[cfg(all(unix, feature = "mmap"))]
use crate::mmap::{self, Mmap};

/// The allocator for the process-wide heap: blocks from 32 bytes up to a
/// 1 GiB arena reserved with `mmap`.
#[cfg(all(unix, feature = "mmap"))]
#[cfg_attr(docs_rs, doc(cfg(all(unix, feature = "mmap"))))]
pub type DefaultHeap =
    BuddyAllocator<{ order::DEFAULT_MIN_ORDER }, { order::DEFAULT_MAX_ORDER }, Mmap>;

/// A binary-buddy allocator over a single arena.
///
/// This takes two const parameters:
/// - `MIN_ORDER` is the order of the smallest block, `2^MIN_ORDER` bytes.
/// - `MAX_ORDER` is the order of the arena, `2^MAX_ORDER` bytes.
///
/// These parameters are subject to the following invariants:
/// - `MIN_ORDER <= MAX_ORDER < usize::BITS - 1`.
/// - The smallest block must hold a free-list node and be larger than
///   [`HEADER_SIZE`]; with 64-bit pointers this means `MIN_ORDER >= 5`.
///
/// Constructors return [`AllocInitError::InvalidConfig`] if the parameters
/// violate these invariants.
///
/// For example, the type of a buddy allocator which can allocate blocks of
/// sizes from 32 bytes to 4 KiB would be:
///
/// ```
/// use buddy_heap::BuddyAllocator;
///
/// type CustomBuddyAllocator<A> = BuddyAllocator<5, 12, A>;
/// # fn main() {}
/// ```
pub struct BuddyAllocator<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator> {
    /// Pointer to the arena managed by this allocator.
    pub(crate) base: BasePtr,
    /// Pointer to the region that backs the occupancy bitmap.
    ///
    /// This must not be used while the allocator exists; it is stored solely
    /// so that it may be released or returned in `into_raw_parts()`.
    metadata: NonNull<u8>,
    /// One bit per minimum-order slot, set where an occupied block starts.
    pub(crate) occupied: Bitmap,
    pub(crate) free_lists: FreeLists,
    backing_allocator: A,
}

// SAFETY: the allocator exclusively owns its arena and metadata, and every
// operation that touches them takes `&mut self`.
unsafe impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator + Send> Send
    for BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32> BuddyAllocator<MIN_ORDER, MAX_ORDER, Raw> {
    /// Constructs a new `BuddyAllocator` from raw pointers.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the const parameters are
    /// invalid.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the [`Layout`]
    ///   returned by [`Self::region_layout()`], and it must be valid for reads
    ///   and writes for the entire size indicated by that `Layout`.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout()`], and it must be
    ///   valid for reads and writes for the entire size indicated by that
    ///   `Layout`.
    /// - Neither region may be accessed except through the allocator until
    ///   [`Self::into_raw_parts()`] is called.
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
    ) -> Result<BuddyAllocator<MIN_ORDER, MAX_ORDER, Raw>, AllocInitError> {
        unsafe {
            RawBuddy::<MIN_ORDER, MAX_ORDER>::try_new(metadata, region)
                .map(|parts| parts.with_backing_allocator(Raw))
        }
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the metadata
    /// pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned region pointer becomes the sole owner of the
    /// region that was used to construct the allocator.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let this = ManuallyDrop::new(self);

        (this.base.ptr(), this.metadata)
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const MIN_ORDER: u32, const MAX_ORDER: u32> BuddyAllocator<MIN_ORDER, MAX_ORDER, Global> {
    /// Attempts to construct a new `BuddyAllocator` whose arena and metadata
    /// are allocated from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the const parameters are invalid or if either
    /// region could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new() -> Result<BuddyAllocator<MIN_ORDER, MAX_ORDER, Global>, AllocInitError> {
        let region_layout = Self::region_layout()?;
        let metadata_layout = Self::metadata_layout()?;

        unsafe {
            let region_ptr = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata_ptr = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region_ptr.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            RawBuddy::<MIN_ORDER, MAX_ORDER>::try_new(metadata_ptr, region_ptr)
                .map(|parts| parts.with_backing_allocator(Global))
        }
    }
}

#[cfg(all(unix, feature = "mmap"))]
impl<const MIN_ORDER: u32, const MAX_ORDER: u32> BuddyAllocator<MIN_ORDER, MAX_ORDER, Mmap> {
    /// Attempts to construct a new `BuddyAllocator` whose arena and metadata
    /// are reserved directly from the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the const parameters are invalid or if the
    /// operating system refuses either reservation.
    #[cfg_attr(docs_rs, doc(cfg(all(unix, feature = "mmap"))))]
    pub fn try_new_mmap() -> Result<BuddyAllocator<MIN_ORDER, MAX_ORDER, Mmap>, AllocInitError> {
        let region_layout = Self::region_layout()?;
        let metadata_layout = Self::metadata_layout()?;

        let region_ptr = mmap::reserve(region_layout)?;
        let metadata_ptr = match mmap::reserve(metadata_layout) {
            Ok(m) => m,
            Err(e) => {
                unsafe { mmap::release(region_ptr, region_layout) };
                return Err(e);
            }
        };

        unsafe {
            RawBuddy::<MIN_ORDER, MAX_ORDER>::try_new(metadata_ptr, region_ptr)
                .map(|parts| parts.with_backing_allocator(Mmap))
        }
    }
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator> Drop
    for BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
    fn drop(&mut self) {
        // The layouts were validated when the allocator was constructed.
        let (Ok(region_layout), Ok(metadata_layout)) =
            (Self::region_layout(), Self::metadata_layout())
        else {
            return;
        };

        log::debug!(
            "releasing {}-byte buddy arena at {:p}",
            region_layout.size(),
            self.base.ptr()
        );

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout);
            self.backing_allocator
                .deallocate(self.metadata, metadata_layout);
        }
    }
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator>
    BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
    fn check_config() -> Result<(), AllocInitError> {
        let valid = MIN_ORDER <= MAX_ORDER
            && MAX_ORDER < usize::BITS - 1
            && order::block_size(MIN_ORDER) > HEADER_SIZE
            && order::block_size(MIN_ORDER) >= FREE_BLOCK_SIZE;

        match valid {
            true => Ok(()),
            false => Err(AllocInitError::InvalidConfig),
        }
    }

    /// Returns the layout requirements of the arena managed by an allocator
    /// of this type.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the const parameters are
    /// invalid.
    pub fn region_layout() -> Result<Layout, AllocInitError> {
        Self::check_config()?;

        Layout::from_size_align(
            order::block_size(MAX_ORDER),
            order::block_size(MIN_ORDER),
        )
        .map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the layout requirements of the metadata region for an
    /// allocator of this type.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the const parameters are
    /// invalid.
    pub fn metadata_layout() -> Result<Layout, AllocInitError> {
        Self::check_config()?;

        Ok(Bitmap::map_layout(Self::num_slots()))
    }

    /// Returns the number of minimum-order slots in the arena.
    fn num_slots() -> usize {
        1 << (MAX_ORDER - MIN_ORDER)
    }

    /// Returns the order of the block that would back a request for `size`
    /// bytes, or `None` if no block can hold that many bytes.
    pub fn order_for_size(size: usize) -> Option<u32> {
        order::order_for_size(size, MIN_ORDER, MAX_ORDER)
    }

    #[inline]
    fn slot_of(ofs: usize) -> usize {
        ofs >> MIN_ORDER
    }

    /// Attempts to allocate a block with room for `size` bytes.
    ///
    /// On success, returns a handle to the block's payload. The payload is
    /// at least `size` bytes long, aligned to [`HEADER_SIZE`], and its
    /// contents are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, if `size` exceeds the largest block,
    /// or if no free block of a sufficient order remains.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_block(size)
            .map(|(block, _)| self.base.handle_of(block))
    }

    /// Attempts to allocate a block with room for `size` bytes, returning
    /// its entire usable payload.
    ///
    /// The returned slice is `2^order - HEADER_SIZE` bytes long, which may
    /// exceed `size`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::allocate`].
    pub fn allocate_bytes(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate_block(size)
            .map(|(block, order)| self.base.payload_of(block, order))
    }

    /// Marks a block of sufficient order occupied and returns its offset and
    /// order.
    fn allocate_block(&mut self, size: usize) -> Result<(usize, u32), AllocError> {
        let target_order = Self::order_for_size(size).ok_or(AllocError)?;
        let block = self.take_block(target_order)?;

        unsafe { self.base.set_tag(block, BlockTag::occupied(target_order)) };
        self.occupied.set(Self::slot_of(block), true);

        log::trace!("allocated order-{target_order} block at {block:#x} for {size} bytes");

        Ok((block, target_order))
    }

    /// Removes a free block of order `target_order` from the free lists,
    /// splitting a larger block if none is available.
    fn take_block(&mut self, target_order: u32) -> Result<usize, AllocError> {
        let base = self.base;

        // If there is a free block of the correct size, return it immediately.
        if let Some(block) = unsafe { self.free_lists.pop(base, target_order) } {
            return Ok(block);
        }

        // Otherwise, scan increasing block sizes until a free block is found.
        let (block, found_order) = (target_order + 1..=MAX_ORDER)
            .find_map(|ord| {
                unsafe { self.free_lists.pop(base, ord) }.map(|block| (block, ord))
            })
            .ok_or(AllocError)?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // lower half keeps the offset of the block being split; the upper
        // half goes to the free list one order down.
        for half_order in (target_order..found_order).rev() {
            let upper = block | order::block_size(half_order);

            unsafe {
                base.set_tag(upper, BlockTag::free(half_order));
                self.free_lists.push(base, half_order, upper);
            }

            log::trace!(
                "split order-{} block at {block:#x}, freed upper half at {upper:#x}",
                half_order + 1
            );
        }

        Ok(block)
    }

    /// Locates the block behind `handle` and checks that it is occupied.
    ///
    /// On success, returns the block's offset and tag.
    fn occupied_block(&self, handle: NonNull<u8>) -> Result<(usize, BlockTag), DeallocError> {
        let block = self
            .base
            .block_ofs_of(handle)
            .ok_or(DeallocError::OutOfBounds)?;

        if !order::is_aligned(block, MIN_ORDER) {
            return Err(DeallocError::Misaligned);
        }

        // A set bit means an occupied block starts here, so the tag at
        // `block` was written by the allocator rather than by a caller.
        if !self.occupied.get(Self::slot_of(block)) {
            return Err(DeallocError::NotAllocated);
        }

        let tag = unsafe { self.base.tag(block) };
        let order = tag.order();

        if !tag.occupied || !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(DeallocError::NotAllocated);
        }

        if !order::is_aligned(block, order) {
            return Err(DeallocError::Misaligned);
        }

        Ok((block, tag))
    }

    /// Returns the order of the occupied block behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if `handle` does not refer to an occupied block.
    pub fn order_of(&self, handle: NonNull<u8>) -> Result<u32, DeallocError> {
        self.occupied_block(handle).map(|(_, tag)| tag.order())
    }

    /// Returns the offset from the arena base of the occupied block behind
    /// `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if `handle` does not refer to an occupied block.
    pub fn block_offset(&self, handle: NonNull<u8>) -> Result<usize, DeallocError> {
        self.occupied_block(handle).map(|(block, _)| block)
    }

    /// Returns the number of payload bytes available behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if `handle` does not refer to an occupied block.
    pub fn usable_size(&self, handle: NonNull<u8>) -> Result<usize, DeallocError> {
        self.order_of(handle)
            .map(|order| order::block_size(order) - HEADER_SIZE)
    }

    /// Deallocates the block behind `handle`.
    ///
    /// The block is returned to the free list of its order and merged with
    /// its buddy as far up as possible. Its payload is not cleared.
    ///
    /// # Errors
    ///
    /// Returns an error without modifying the allocator if `handle` does not
    /// point into the arena, is not positioned at a block's payload, or does
    /// not refer to an occupied block (for example, after a double free).
    pub fn deallocate(&mut self, handle: NonNull<u8>) -> Result<(), DeallocError> {
        let (block, tag) = self.occupied_block(handle).map_err(|e| {
            log::trace!("rejected deallocation of {handle:p}: {e}");
            e
        })?;
        let block_order = tag.order();

        self.occupied.set(Self::slot_of(block), false);

        unsafe {
            self.base.set_tag(block, BlockTag::free(block_order));
            self.free_lists.push(self.base, block_order, block);
        }

        log::trace!("freed order-{block_order} block at {block:#x}");

        self.coalesce(block, block_order);

        Ok(())
    }

    /// Merges the freshly freed order-`block_order` block at `block` with its
    /// buddy, and the result with its own buddy, until a buddy is not free.
    ///
    /// The block must be in the free list of its order. On return, it or the
    /// block it merged into is in exactly one free list.
    fn coalesce(&mut self, mut block: usize, mut block_order: u32) {
        let base = self.base;

        // Each merge raises the order by one, so this runs at most
        // `MAX_ORDER - MIN_ORDER` times.
        while block_order < MAX_ORDER {
            let buddy = order::buddy_of(block, block_order);

            if !unsafe { self.free_lists.contains(base, block_order, buddy) } {
                break;
            }

            unsafe {
                self.free_lists.remove(base, block_order, block);
                self.free_lists.remove(base, block_order, buddy);
            }

            // The merged block is identified by the lower of the two offsets.
            block = cmp::min(block, buddy);
            block_order += 1;

            unsafe {
                base.set_tag(block, BlockTag::free(block_order));
                self.free_lists.push(base, block_order, block);
            }

            log::trace!("merged buddies into order-{block_order} block at {block:#x}");
        }
    }

    /// Returns a pointer to the start of the arena.
    pub fn arena_base(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns the size of the arena in bytes.
    pub fn arena_size(&self) -> usize {
        self.base.extent()
    }
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator> fmt::Debug
    for BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &self.base.ptr())
            .field("min_order", &MIN_ORDER)
            .field("max_order", &MAX_ORDER)
            .field("allocated_blocks", &self.occupied.count_ones())
            .finish_non_exhaustive()
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `BuddyAllocator` itself cannot.
struct RawBuddy<const MIN_ORDER: u32, const MAX_ORDER: u32> {
    base: BasePtr,
    metadata: NonNull<u8>,
    occupied: Bitmap,
    free_lists: FreeLists,
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32> RawBuddy<MIN_ORDER, MAX_ORDER> {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyAllocator<MIN_ORDER, MAX_ORDER, A> {
        let RawBuddy {
            base,
            metadata,
            occupied,
            free_lists,
        } = self;

        BuddyAllocator {
            base,
            metadata,
            occupied,
            free_lists,
            backing_allocator,
        }
    }

    /// Constructs a new `RawBuddy` from raw pointers, seeding the free lists
    /// with a single block spanning the arena.
    ///
    /// # Safety
    ///
    /// The caller must uphold the invariants of
    /// [`BuddyAllocator::new_raw()`].
    unsafe fn try_new(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
    ) -> Result<RawBuddy<MIN_ORDER, MAX_ORDER>, AllocInitError> {
        let region_layout = BuddyAllocator::<MIN_ORDER, MAX_ORDER, Raw>::region_layout()?;
        let num_slots = BuddyAllocator::<MIN_ORDER, MAX_ORDER, Raw>::num_slots();

        debug_assert_eq!(
            metadata.as_ptr().align_offset(mem::align_of::<u64>()),
            0,
            "misaligned metadata"
        );
        debug_assert_eq!(
            region.as_ptr().align_offset(region_layout.align()),
            0,
            "misaligned arena"
        );

        let base = BasePtr::new(region, region_layout.size());
        let occupied = unsafe { Bitmap::new(num_slots, metadata.as_ptr().cast::<u64>()) };
        let mut free_lists = FreeLists::new();

        unsafe {
            base.set_tag(0, BlockTag::free(MAX_ORDER));
            free_lists.push(base, MAX_ORDER, 0);
        }

        log::debug!(
            "initialized buddy arena of {} bytes at {:p} (orders {MIN_ORDER}..={MAX_ORDER})",
            region_layout.size(),
            region
        );

        Ok(RawBuddy {
            base,
            metadata,
            occupied,
            free_lists,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    /// A 128-byte arena with blocks of 32, 64 and 128 bytes.
    type TinyHeap = BuddyAllocator<5, 7, Global>;

    /// A 256-byte arena with blocks of 32 to 256 bytes.
    type SmallHeap = BuddyAllocator<5, 8, Global>;

    /// A 4 KiB arena with blocks of 32 bytes to 4 KiB.
    type PageHeap = BuddyAllocator<5, 12, Global>;

    fn free_offsets<const MIN: u32, const MAX: u32, A: BackingAllocator>(
        heap: &BuddyAllocator<MIN, MAX, A>,
        order: u32,
    ) -> Vec<usize> {
        heap.free_blocks(order).collect()
    }

    fn assert_pristine<const MIN: u32, const MAX: u32, A: BackingAllocator>(
        heap: &BuddyAllocator<MIN, MAX, A>,
    ) {
        for order in MIN..MAX {
            assert!(free_offsets(heap, order).is_empty(), "order {order} not empty");
        }
        assert_eq!(free_offsets(heap, MAX), [0]);
        heap.check_free_lists();
        heap.verify_tiling();
    }

    #[test]
    fn new_heap_is_one_free_block() {
        let heap = PageHeap::try_new().unwrap();
        assert_pristine(&heap);
        assert_eq!(heap.arena_size(), 4096);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        // Too small for a free-list node.
        assert!(matches!(
            BuddyAllocator::<3, 8, Global>::try_new(),
            Err(AllocInitError::InvalidConfig)
        ));
        // Inverted bounds.
        assert!(matches!(
            BuddyAllocator::<8, 7, Global>::try_new(),
            Err(AllocInitError::InvalidConfig)
        ));
        // Arena order out of range.
        assert!(matches!(
            BuddyAllocator::<5, { usize::BITS }, Global>::region_layout(),
            Err(AllocInitError::InvalidConfig)
        ));
    }

    #[test]
    fn handles_are_aligned_to_their_order() {
        let mut heap = PageHeap::try_new().unwrap();
        let base = heap.arena_base().as_ptr() as usize;

        for size in [1, 7, 16, 17, 100, 300, 1000, 2000] {
            let handle = heap.allocate(size).unwrap();
            let order = heap.order_of(handle).unwrap();
            let block = handle.as_ptr() as usize - HEADER_SIZE - base;

            assert_eq!(block % (1 << order), 0, "size {size}");
            assert_eq!(handle.as_ptr() as usize % HEADER_SIZE, 0);
            assert!(heap.usable_size(handle).unwrap() >= size);
        }

        heap.check_free_lists();
        heap.verify_tiling();
    }

    #[test]
    fn minimum_block_size_boundaries() {
        let mut heap = PageHeap::try_new().unwrap();

        let one = heap.allocate(1).unwrap();
        assert_eq!(heap.order_of(one), Ok(5));

        let exact = heap.allocate(32 - HEADER_SIZE).unwrap();
        assert_eq!(heap.order_of(exact), Ok(5));

        let over = heap.allocate(32 - HEADER_SIZE + 1).unwrap();
        assert_eq!(heap.order_of(over), Ok(6));
    }

    #[test]
    fn split_leaves_one_upper_half_per_order() {
        let mut heap = SmallHeap::try_new().unwrap();

        let handle = heap.allocate(1).unwrap();
        assert_eq!(heap.block_offset(handle), Ok(0));

        assert_eq!(free_offsets(&heap, 5), [32]);
        assert_eq!(free_offsets(&heap, 6), [64]);
        assert_eq!(free_offsets(&heap, 7), [128]);
        assert!(free_offsets(&heap, 8).is_empty());
        heap.verify_tiling();
    }

    #[test]
    fn buddies_merge_in_either_order() {
        for lower_first in [true, false] {
            let mut heap = SmallHeap::try_new().unwrap();

            // Two order-5 buddies at 0 and 32, plus an order-6 block at 64
            // which keeps the merge from cascading past order 6.
            let lower = heap.allocate(16).unwrap();
            let upper = heap.allocate(16).unwrap();
            let pin = heap.allocate(48).unwrap();

            assert_eq!(heap.block_offset(lower), Ok(0));
            assert_eq!(heap.block_offset(upper), Ok(32));
            assert_eq!(heap.block_offset(pin), Ok(64));

            let (first, second) = match lower_first {
                true => (lower, upper),
                false => (upper, lower),
            };

            heap.deallocate(first).unwrap();
            assert_eq!(free_offsets(&heap, 5).len(), 1);

            heap.deallocate(second).unwrap();
            assert!(free_offsets(&heap, 5).is_empty());
            assert_eq!(free_offsets(&heap, 6), [0]);
            assert_eq!(free_offsets(&heap, 7), [128]);

            heap.check_free_lists();
            heap.verify_tiling();
        }
    }

    #[test]
    fn freed_block_is_reused() {
        let mut heap = PageHeap::try_new().unwrap();

        let first = heap.allocate(200).unwrap();
        heap.deallocate(first).unwrap();

        let second = heap.allocate(200).unwrap();
        assert_eq!(heap.order_of(second), Ok(8));
        assert_eq!(heap.block_offset(second), Ok(0));
        heap.deallocate(second).unwrap();

        assert_pristine(&heap);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = TinyHeap::try_new().unwrap();

        // 48 payload bytes plus the header need a 64-byte block.
        let a = heap.allocate(48).unwrap();
        let b = heap.allocate(48).unwrap();
        assert_eq!(heap.allocate(48), Err(AllocError));

        heap.deallocate(a).unwrap();
        heap.deallocate(b).unwrap();

        // Four minimum-order blocks fill the same arena.
        let small: Vec<_> = (0..4).map(|_| heap.allocate(16).unwrap()).collect();
        assert_eq!(heap.allocate(1), Err(AllocError));

        for handle in small {
            heap.deallocate(handle).unwrap();
        }
        assert_pristine(&heap);
    }

    #[test]
    fn unsatisfiable_sizes_are_rejected() {
        let mut heap = TinyHeap::try_new().unwrap();

        assert_eq!(heap.allocate(0), Err(AllocError));
        assert_eq!(heap.allocate(128 - HEADER_SIZE + 1), Err(AllocError));
        assert_eq!(heap.allocate(usize::MAX), Err(AllocError));
        assert_pristine(&heap);
    }

    #[test]
    fn full_arena_round_trip() {
        let mut heap = TinyHeap::try_new().unwrap();

        let whole = heap.allocate(128 - HEADER_SIZE).unwrap();
        assert_eq!(heap.order_of(whole), Ok(7));
        assert!((5..=7).all(|order| free_offsets(&heap, order).is_empty()));
        heap.verify_tiling();

        heap.deallocate(whole).unwrap();
        assert_pristine(&heap);
    }

    #[test]
    fn cascaded_merges_list_each_block_once() {
        let mut heap = SmallHeap::try_new().unwrap();

        let handles: Vec<_> = (0..8).map(|_| heap.allocate(1).unwrap()).collect();
        assert_eq!(heap.allocate(1), Err(AllocError));

        // Free in an order that exercises merges at every level.
        for idx in [5, 0, 3, 6, 1, 7, 2, 4] {
            heap.deallocate(handles[idx]).unwrap();
            heap.check_free_lists();
            heap.verify_tiling();
        }

        assert_pristine(&heap);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut heap = SmallHeap::try_new().unwrap();

        let keep = heap.allocate(16).unwrap();
        let handle = heap.allocate(16).unwrap();
        heap.deallocate(handle).unwrap();

        assert_eq!(heap.deallocate(handle), Err(DeallocError::NotAllocated));
        heap.check_free_lists();
        heap.verify_tiling();

        heap.deallocate(keep).unwrap();
        assert_pristine(&heap);
    }

    #[test]
    fn foreign_and_interior_handles_are_rejected() {
        let mut heap = SmallHeap::try_new().unwrap();
        let handle = heap.allocate(100).unwrap();

        let dangling = NonNull::<u8>::dangling();
        assert_eq!(heap.deallocate(dangling), Err(DeallocError::OutOfBounds));

        let past_end = NonNull::new(heap.arena_base().as_ptr().wrapping_add(256 + HEADER_SIZE));
        assert_eq!(heap.deallocate(past_end.unwrap()), Err(DeallocError::OutOfBounds));

        let shifted = NonNull::new(handle.as_ptr().wrapping_add(1)).unwrap();
        assert_eq!(heap.deallocate(shifted), Err(DeallocError::Misaligned));

        // A slot inside the occupied order-7 block where no block starts.
        let interior = NonNull::new(handle.as_ptr().wrapping_add(64)).unwrap();
        assert_eq!(heap.deallocate(interior), Err(DeallocError::NotAllocated));

        // A free block is not an allocation.
        let free = heap.base.handle_of(128);
        assert_eq!(heap.deallocate(free), Err(DeallocError::NotAllocated));

        heap.verify_tiling();
        heap.deallocate(handle).unwrap();
        assert_pristine(&heap);
    }

    #[test]
    fn allocate_bytes_spans_the_block() {
        let mut heap = PageHeap::try_new().unwrap();

        let bytes = heap.allocate_bytes(100).unwrap();
        assert_eq!(bytes.len(), 128 - HEADER_SIZE);

        // The whole payload is writable without disturbing the heap.
        unsafe { bytes.cast::<u8>().as_ptr().write_bytes(0xA5, bytes.len()) };
        heap.check_free_lists();
        heap.verify_tiling();

        heap.deallocate(bytes.cast()).unwrap();
        assert_pristine(&heap);
    }

    #[test]
    fn raw_parts_round_trip() {
        type RawHeap = BuddyAllocator<5, 9, Raw>;

        let region_layout = RawHeap::region_layout().unwrap();
        let metadata_layout = RawHeap::metadata_layout().unwrap();

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout)).unwrap();
            let metadata = NonNull::new(alloc::alloc::alloc(metadata_layout)).unwrap();

            let mut heap = RawHeap::new_raw(metadata, region).unwrap();
            let handle = heap.allocate(40).unwrap();
            assert_eq!(heap.arena_base(), region);
            heap.deallocate(handle).unwrap();

            let (r, m) = heap.into_raw_parts();
            assert_eq!((r, m), (region, metadata));

            alloc::alloc::dealloc(r.as_ptr(), region_layout);
            alloc::alloc::dealloc(m.as_ptr(), metadata_layout);
        }
    }

    #[cfg(all(unix, feature = "mmap"))]
    #[test]
    fn mmap_backed_heap() {
        let mut heap = BuddyAllocator::<5, 20, Mmap>::try_new_mmap().unwrap();

        let handles: Vec<_> = [10, 1000, 100_000]
            .into_iter()
            .map(|size| heap.allocate(size).unwrap())
            .collect();

        heap.verify_tiling();

        for handle in handles {
            heap.deallocate(handle).unwrap();
        }
        assert_pristine(&heap);
    }
}
