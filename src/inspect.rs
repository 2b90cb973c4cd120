//! Heap inspection.
//!
//! Nothing here changes the allocator. The checks panic on the first
//! inconsistency they find, since a broken free list means the heap can no
//! longer be trusted.

use core::fmt;

use crate::{
    base::BasePtr,
    buddy::BuddyAllocator,
    free_list,
    header::BlockTag,
    order::{self, block_size},
    BackingAllocator,
};

/// An iterator over the arena offsets of the free blocks of one order.
///
/// Returned by [`BuddyAllocator::free_blocks`].
pub struct FreeBlocks<'a> {
    inner: Option<free_list::Iter<'a>>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.inner.as_mut()?.next()
    }
}

impl fmt::Debug for FreeBlocks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBlocks").finish_non_exhaustive()
    }
}

/// A summary of the arena's occupancy.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
    /// The size of the arena in bytes.
    pub arena_size: usize,
    /// The number of occupied blocks.
    pub allocated_blocks: usize,
    /// The total size of the occupied blocks, headers included.
    pub allocated_bytes: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of the free blocks.
    pub free_bytes: usize,
    /// The size of the largest free block, or zero if the arena is full.
    pub largest_free_block: usize,
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator>
    BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
    /// Returns an iterator over the offsets of the free blocks of order
    /// `order`, in free-list order.
    ///
    /// Orders outside `MIN_ORDER..=MAX_ORDER` have no free blocks.
    pub fn free_blocks(&self, order: u32) -> FreeBlocks<'_> {
        let inner = (MIN_ORDER..=MAX_ORDER)
            .contains(&order)
            // SAFETY: the allocator keeps every listed block's link initialized,
            // and the shared borrow prevents modification.
            .then(|| unsafe { self.free_lists.iter(self.base, order) });

        FreeBlocks { inner }
    }

    /// Walks every free list and checks that its blocks are in bounds,
    /// aligned, tagged free with the list's order, and doubly linked
    /// consistently.
    ///
    /// # Panics
    ///
    /// Panics if any check fails.
    pub fn check_free_lists(&self) {
        let base = self.base;

        for ord in MIN_ORDER..=MAX_ORDER {
            let mut prev = None;
            let mut len = 0;

            let mut cur = self.free_lists.head(ord);
            while let Some(block) = cur {
                assert!(
                    base.contains_ofs(block),
                    "order {ord}: block {block:#x} outside arena"
                );
                assert!(
                    order::is_aligned(block, ord),
                    "order {ord}: block {block:#x} misaligned"
                );

                let tag = unsafe { base.tag(block) };
                assert_eq!(
                    tag,
                    BlockTag::free(ord),
                    "order {ord}: block {block:#x} has tag {tag:?}"
                );

                let link = unsafe { base.link(block) };
                assert_eq!(
                    link.prev(),
                    prev,
                    "order {ord}: block {block:#x} links back to the wrong block"
                );

                len += 1;
                assert!(
                    len <= base.extent() >> ord,
                    "order {ord}: free list is cyclic"
                );

                prev = Some(block);
                cur = link.next();
            }

            assert_eq!(
                len,
                self.free_lists.len(ord),
                "order {ord}: free list length mismatch"
            );
        }
    }

    /// Walks the arena block by block and checks that the occupied and free
    /// blocks tile it exactly, that every free block is listed exactly once,
    /// and that the occupancy map agrees with the block tags.
    ///
    /// This is quadratic in the number of free blocks.
    ///
    /// # Panics
    ///
    /// Panics if any check fails.
    pub fn verify_tiling(&self) {
        let base = self.base;
        let mut ofs = 0;
        let mut free_seen = 0;
        let mut occupied_seen = 0;

        assert_eq!(
            self.occupied.len(),
            base.extent() >> MIN_ORDER,
            "occupancy map does not cover the arena"
        );

        while base.contains_ofs(ofs) {
            let tag = unsafe { base.tag(ofs) };
            let ord = tag.order();

            assert!(
                (MIN_ORDER..=MAX_ORDER).contains(&ord),
                "block {ofs:#x} has out-of-range order {ord}"
            );
            assert!(
                order::is_aligned(ofs, ord),
                "block {ofs:#x} misaligned for order {ord}"
            );

            let slot = ofs >> MIN_ORDER;
            assert_eq!(
                self.occupied.get(slot),
                tag.occupied,
                "occupancy map disagrees with tag of block {ofs:#x}"
            );

            if tag.occupied {
                occupied_seen += 1;
            } else {
                let listed = unsafe { self.free_lists.iter(base, ord) }
                    .filter(|&b| b == ofs)
                    .count();
                assert_eq!(listed, 1, "free block {ofs:#x} listed {listed} times");
                free_seen += 1;
            }

            // No block may start inside this one.
            let end = ofs + block_size(ord);
            for inner in (ofs + block_size(MIN_ORDER)..end).step_by(block_size(MIN_ORDER)) {
                assert!(
                    !self.occupied.get(inner >> MIN_ORDER),
                    "occupied block at {inner:#x} overlaps block {ofs:#x}"
                );
            }

            ofs = end;
        }

        assert_eq!(ofs, base.extent(), "blocks overrun the arena");

        let listed: usize = (MIN_ORDER..=MAX_ORDER)
            .map(|ord| self.free_lists.len(ord))
            .sum();
        assert_eq!(listed, free_seen, "free lists hold blocks not in the arena");
        assert_eq!(
            occupied_seen,
            self.occupied.count_ones(),
            "occupancy map marks blocks not in the arena"
        );
    }

    /// Summarizes the arena's occupancy by walking its blocks.
    pub fn stats(&self) -> HeapStats {
        let base = self.base;
        let mut stats = HeapStats {
            arena_size: base.extent(),
            ..HeapStats::default()
        };

        for tag in block_tags(base) {
            let size = block_size(tag.order());

            if tag.occupied {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free_block = stats.largest_free_block.max(size);
            }
        }

        stats
    }

    /// Writes a listing of every free list to `w`.
    ///
    /// Each line holds one order followed by its blocks as
    /// `[occupied:offset:size]`:
    ///
    /// ```text
    /// 5->[0:32:32]->NULL
    /// 6->[0:64:64]->NULL
    /// 7->NULL
    /// ```
    ///
    /// # Errors
    ///
    /// Returns any error produced by `w`.
    pub fn dump_heap<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        for ord in MIN_ORDER..=MAX_ORDER {
            write!(w, "{ord}->")?;

            for block in self.free_blocks(ord) {
                let tag = unsafe { self.base.tag(block) };
                write!(
                    w,
                    "[{}:{}:{}]->",
                    u8::from(tag.occupied),
                    block,
                    block_size(tag.order())
                )?;
            }

            writeln!(w, "NULL")?;
        }

        Ok(())
    }
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32, A: BackingAllocator> fmt::Display
    for BuddyAllocator<MIN_ORDER, MAX_ORDER, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump_heap(f)
    }
}

/// Iterates over the tags of a consistent arena's blocks by following block
/// sizes from offset zero.
fn block_tags(base: BasePtr) -> impl Iterator<Item = BlockTag> {
    let mut ofs = 0;

    core::iter::from_fn(move || {
        if !base.contains_ofs(ofs) {
            return None;
        }

        // SAFETY: in a consistent arena, `ofs` is always the start of a block.
        let tag = unsafe { base.tag(ofs) };
        ofs += block_size(tag.order());

        Some(tag)
    })
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{string::String, vec::Vec};

    use crate::{BuddyAllocator, Global, HeapStats, HEADER_SIZE};

    type TinyHeap = BuddyAllocator<5, 7, Global>;

    #[test]
    fn dump_of_fresh_heap() {
        let heap = TinyHeap::try_new().unwrap();

        let mut out = String::new();
        heap.dump_heap(&mut out).unwrap();
        assert_eq!(out, "5->NULL\n6->NULL\n7->[0:0:128]->NULL\n");
        assert_eq!(std::format!("{heap}"), out);
    }

    #[test]
    fn dump_after_split() {
        let mut heap = TinyHeap::try_new().unwrap();
        let handle = heap.allocate(1).unwrap();

        let mut out = String::new();
        heap.dump_heap(&mut out).unwrap();
        assert_eq!(out, "5->[0:32:32]->NULL\n6->[0:64:64]->NULL\n7->NULL\n");

        heap.deallocate(handle).unwrap();
    }

    #[test]
    fn stats_track_occupancy() {
        let mut heap = BuddyAllocator::<5, 10, Global>::try_new().unwrap();
        assert_eq!(
            heap.stats(),
            HeapStats {
                arena_size: 1024,
                free_blocks: 1,
                free_bytes: 1024,
                largest_free_block: 1024,
                ..HeapStats::default()
            }
        );

        let handles: Vec<_> = [1, 64 - HEADER_SIZE, 200]
            .into_iter()
            .map(|size| heap.allocate(size).unwrap())
            .collect();

        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 3);
        assert_eq!(stats.allocated_bytes, 32 + 64 + 256);
        assert_eq!(stats.allocated_bytes + stats.free_bytes, 1024);
        assert_eq!(stats.largest_free_block, 512);

        for handle in handles {
            heap.deallocate(handle).unwrap();
        }
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn free_blocks_outside_order_range_is_empty() {
        let heap = TinyHeap::try_new().unwrap();

        assert_eq!(heap.free_blocks(4).count(), 0);
        assert_eq!(heap.free_blocks(8).count(), 0);
        assert_eq!(heap.free_blocks(7).collect::<Vec<_>>(), [0]);
    }

    #[test]
    #[should_panic(expected = "has tag")]
    fn corrupted_tag_is_detected() {
        let heap = TinyHeap::try_new().unwrap();

        // Mark the only free block occupied behind the allocator's back.
        unsafe { heap.arena_base().as_ptr().write(1) };
        heap.check_free_lists();
    }
}
