use core::{mem, num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

use crate::header::{BlockTag, DoubleBlockLink, HEADER_SIZE, LINK_OFFSET};

/// A pointer to the base of the arena managed by an allocator.
///
/// Every pointer into the arena is derived from this one, so all of them
/// carry the arena's provenance.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` spanning `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.as_ptr()
            .addr()
            .checked_add(extent)
            .expect("arena limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        // SAFETY: the pointer is non-null.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.as_ptr().addr()) }
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn contains_ofs(self, ofs: usize) -> bool {
        ofs < self.extent
    }

    /// Returns the offset of the block whose payload begins at `handle`.
    ///
    /// Returns `None` if that block would not start inside the arena.
    #[inline]
    pub fn block_ofs_of(self, handle: NonNull<u8>) -> Option<usize> {
        handle
            .as_ptr()
            .addr()
            .checked_sub(HEADER_SIZE)?
            .checked_sub(self.addr().get())
            .filter(|&ofs| self.contains_ofs(ofs))
    }

    /// Creates a new pointer at the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: usize) -> NonNull<u8> {
        debug_assert!(ofs <= self.extent);

        let addr = self.addr().get() + ofs;

        // SAFETY: `addr` is no less than the base address, which is non-zero.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().with_addr(addr)) }
    }

    /// Returns the handle for the block at `ofs`.
    #[inline]
    pub fn handle_of(self, ofs: usize) -> NonNull<u8> {
        debug_assert!(self.contains_ofs(ofs));

        self.with_offset(ofs + HEADER_SIZE)
    }

    /// Returns the usable payload of the order-`order` block at `ofs`.
    #[inline]
    pub fn payload_of(self, ofs: usize, order: u32) -> NonNull<[u8]> {
        let len = (1_usize << order) - HEADER_SIZE;

        NonNull::slice_from_raw_parts(self.handle_of(ofs), len)
    }

    /// Reads the tag of the block at `ofs`.
    ///
    /// # Safety
    ///
    /// `ofs` must be the offset of a block whose tag has been initialized.
    #[inline]
    pub unsafe fn tag(self, ofs: usize) -> BlockTag {
        debug_assert!(self.contains_ofs(ofs));

        unsafe { self.with_offset(ofs).cast::<BlockTag>().as_ptr().read() }
    }

    /// Writes the tag of the block at `ofs`.
    ///
    /// # Safety
    ///
    /// `ofs` must be the offset of a block that is not handed out to a caller,
    /// or of an occupied block whose header is being rewritten by the
    /// allocator.
    #[inline]
    pub unsafe fn set_tag(self, ofs: usize, tag: BlockTag) {
        debug_assert!(self.contains_ofs(ofs));

        unsafe { self.with_offset(ofs).cast::<BlockTag>().as_ptr().write(tag) };
    }

    /// Initializes a `DoubleBlockLink` in the block at `ofs`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be the offset of a block at least `FREE_BLOCK_SIZE` bytes
    ///   long that is aligned for `DoubleBlockLink` values.
    /// - The block at `ofs` must be free.
    #[inline]
    pub unsafe fn init_link_at(self, ofs: usize, link: DoubleBlockLink) {
        debug_assert!(self.contains_ofs(ofs));
        debug_assert!(
            link.next().map_or(true, |next| self.contains_ofs(next)),
            "next link out of arena"
        );
        debug_assert!(
            link.prev().map_or(true, |prev| self.contains_ofs(prev)),
            "prev link out of arena"
        );

        unsafe { self.link_ptr(ofs).as_ptr().write(link) };
    }

    /// Returns a mutable reference to the `DoubleBlockLink` in the block at
    /// `ofs`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The block at `ofs` must contain a properly initialized
    ///   `DoubleBlockLink` value.
    /// - The block at `ofs` must be free, and no other reference to its link
    ///   may be live.
    #[inline]
    pub unsafe fn link_mut<'a>(self, ofs: usize) -> &'a mut DoubleBlockLink {
        debug_assert!(self.contains_ofs(ofs));

        unsafe { self.link_ptr(ofs).as_mut() }
    }

    /// Returns a shared reference to the `DoubleBlockLink` in the block at
    /// `ofs`.
    ///
    /// # Safety
    ///
    /// Same as [`Self::link_mut`], except that other shared references may
    /// be live.
    #[inline]
    pub unsafe fn link<'a>(self, ofs: usize) -> &'a DoubleBlockLink {
        debug_assert!(self.contains_ofs(ofs));

        unsafe { self.link_ptr(ofs).as_ref() }
    }

    #[inline]
    fn link_ptr(self, ofs: usize) -> NonNull<DoubleBlockLink> {
        let link = self.with_offset(ofs + LINK_OFFSET).cast::<DoubleBlockLink>();
        debug_assert_eq!(
            link.as_ptr().addr() % mem::align_of::<DoubleBlockLink>(),
            0
        );

        link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    #[test]
    fn block_ofs_of_inverts_handle_of() {
        let mut arena = vec![0_u64; 32];
        let ptr = NonNull::new(arena.as_mut_ptr().cast::<u8>()).unwrap();
        let base = BasePtr::new(ptr, 256);

        for ofs in [0, 32, 96, 224] {
            assert_eq!(base.block_ofs_of(base.handle_of(ofs)), Some(ofs));
        }

        assert_eq!(base.block_ofs_of(ptr), None);

        let past_end = NonNull::new(ptr.as_ptr().wrapping_add(256 + HEADER_SIZE)).unwrap();
        assert_eq!(base.block_ofs_of(past_end), None);
    }

    #[test]
    fn tags_and_links_do_not_overlap() {
        let mut arena = vec![0_u64; 8];
        let ptr = NonNull::new(arena.as_mut_ptr().cast::<u8>()).unwrap();
        let base = BasePtr::new(ptr, 64);

        unsafe {
            base.set_tag(32, BlockTag::free(5));
            base.init_link_at(32, DoubleBlockLink::new(Some(0), None));

            assert_eq!(base.tag(32), BlockTag::free(5));
            assert_eq!(base.link(32).prev(), Some(0));
            assert_eq!(base.link(32).next(), None);
        }
    }
}
