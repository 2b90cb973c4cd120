//! Per-block metadata embedded at the start of every block.
//!
//! ```text
//!  offset 0        LINK_OFFSET                 HEADER_SIZE
//!  +-----+-------+------------+------------+---------------------------
//!  | tag |  pad  | link.prev  | link.next  | ...          (free block)
//!  +-----+-------+------------+------------+---------------------------
//!  | tag |  pad  | (unused)                | payload  (occupied block)
//!  +-----+-------+-------------------------+---------------------------
//! ```
//!
//! The tag is valid for the whole life of the block. The link is only
//! meaningful while the block is free; once the block is handed out, the
//! payload begins at `HEADER_SIZE` and the bytes between the tag and the
//! payload are left alone.

use core::mem;

/// The number of bytes between the start of a block and the handle returned
/// to the caller.
///
/// This is also the alignment of every handle relative to the arena base.
pub const HEADER_SIZE: usize = 16;

/// The offset of the free-list link within a free block.
pub const LINK_OFFSET: usize = mem::align_of::<DoubleBlockLink>();

/// The number of bytes a block must span to hold its tag and its link.
pub const FREE_BLOCK_SIZE: usize = LINK_OFFSET + mem::size_of::<DoubleBlockLink>();

const _: () = assert!(mem::size_of::<BlockTag>() <= LINK_OFFSET);
const _: () = assert!(HEADER_SIZE.is_power_of_two());

/// The state of a single block.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockTag {
    pub occupied: bool,
    pub order: u8,
}

impl BlockTag {
    #[inline]
    pub fn free(order: u32) -> BlockTag {
        BlockTag {
            occupied: false,
            order: order.try_into().expect("block order overflows u8"),
        }
    }

    #[inline]
    pub fn occupied(order: u32) -> BlockTag {
        BlockTag {
            occupied: true,
            ..BlockTag::free(order)
        }
    }

    #[inline]
    pub fn order(self) -> u32 {
        self.order.into()
    }
}

const NIL: usize = usize::MAX;

/// A double link in a free list of blocks.
///
/// Links hold offsets from the arena base rather than addresses. Any pointer
/// to a linked block must be acquired via the base pointer.
#[repr(C)]
#[derive(Debug)]
pub struct DoubleBlockLink {
    prev: usize,
    next: usize,
}

impl DoubleBlockLink {
    #[inline]
    pub fn new(prev: Option<usize>, next: Option<usize>) -> DoubleBlockLink {
        DoubleBlockLink {
            prev: encode(prev),
            next: encode(next),
        }
    }

    #[inline]
    pub fn prev(&self) -> Option<usize> {
        decode(self.prev)
    }

    #[inline]
    pub fn next(&self) -> Option<usize> {
        decode(self.next)
    }

    #[inline]
    pub fn set_prev(&mut self, prev: Option<usize>) {
        self.prev = encode(prev);
    }

    #[inline]
    pub fn set_next(&mut self, next: Option<usize>) {
        self.next = encode(next);
    }
}

// Arena offsets are always below `isize::MAX`, so `NIL` never collides with a
// real block.
#[inline]
fn encode(ofs: Option<usize>) -> usize {
    match ofs {
        Some(ofs) => {
            debug_assert_ne!(ofs, NIL);
            ofs
        }
        None => NIL,
    }
}

#[inline]
fn decode(raw: usize) -> Option<usize> {
    (raw != NIL).then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_block_fits_in_smallest_block() {
        assert!(FREE_BLOCK_SIZE <= 1 << crate::DEFAULT_MIN_ORDER);
        assert!(HEADER_SIZE < 1 << crate::DEFAULT_MIN_ORDER);
    }

    #[test]
    fn link_round_trips_offset_zero() {
        let mut link = DoubleBlockLink::new(Some(0), None);
        assert_eq!(link.prev(), Some(0));
        assert_eq!(link.next(), None);

        link.set_next(Some(64));
        link.set_prev(None);
        assert_eq!(link.prev(), None);
        assert_eq!(link.next(), Some(64));
    }

    #[test]
    fn occupied_tag_keeps_order() {
        let tag = BlockTag::occupied(9);
        assert!(tag.occupied);
        assert_eq!(tag.order(), 9);
        assert_eq!(BlockTag::free(9), BlockTag { occupied: false, ..tag });
    }
}
