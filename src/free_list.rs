//! The free-list registry: one intrusive, doubly linked list per order.

use core::marker::PhantomData;

use crate::{base::BasePtr, header::DoubleBlockLink};

/// Enough slots to index the registry directly by order.
const ORDER_SLOTS: usize = usize::BITS as usize;

pub struct FreeLists {
    heads: [Option<usize>; ORDER_SLOTS],
    lens: [usize; ORDER_SLOTS],
}

impl FreeLists {
    pub const fn new() -> FreeLists {
        FreeLists {
            heads: [None; ORDER_SLOTS],
            lens: [0; ORDER_SLOTS],
        }
    }

    #[inline]
    pub fn head(&self, order: u32) -> Option<usize> {
        self.heads[order as usize]
    }

    #[inline]
    pub fn len(&self, order: u32) -> usize {
        self.lens[order as usize]
    }

    /// Pushes the block at `block` onto the head of the order-`order` list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be the offset of a free order-`order` block within
    ///   `base` which is not already in any free list.
    /// - Every block in the list must hold an initialized link.
    pub unsafe fn push(&mut self, base: BasePtr, order: u32, block: usize) {
        let slot = order as usize;
        let old_head = self.heads[slot];

        if let Some(old_head) = old_head {
            unsafe { base.link_mut(old_head).set_prev(Some(block)) };
        }

        // `block` points forward to `old_head`, which points back to `block`.
        unsafe { base.init_link_at(block, DoubleBlockLink::new(None, old_head)) };

        self.heads[slot] = Some(block);
        self.lens[slot] += 1;
    }

    /// Pops the head of the order-`order` list.
    ///
    /// If the list is empty, returns `None`.
    ///
    /// # Safety
    ///
    /// Every block in the list must hold an initialized link within `base`.
    pub unsafe fn pop(&mut self, base: BasePtr, order: u32) -> Option<usize> {
        let head = self.head(order)?;

        unsafe { self.remove(base, order, head) };

        Some(head)
    }

    /// Removes the specified block from the order-`order` list.
    ///
    /// Either neighbor may be absent; a block with no predecessor is the
    /// head, and the head moves to its successor.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be an element of the order-`order` list.
    /// - Every block in the list must hold an initialized link within `base`.
    pub unsafe fn remove(&mut self, base: BasePtr, order: u32, block: usize) {
        let slot = order as usize;

        unsafe {
            let removed = base.link_mut(block);
            let (prev, next) = (removed.prev(), removed.next());

            match prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).set_next(next),

                // If there's no previous block, then `removed` is the head of
                // the list.
                None => {
                    debug_assert_eq!(self.heads[slot], Some(block));
                    self.heads[slot] = next;
                }
            }

            if let Some(n) = next {
                // Link `next` back to `prev`.
                base.link_mut(n).set_prev(prev);
            }
        }

        self.lens[slot] -= 1;
    }

    /// Returns whether the block at `block` is in the order-`order` list.
    ///
    /// This is a linear scan of the list.
    ///
    /// # Safety
    ///
    /// Every block in the list must hold an initialized link within `base`.
    pub unsafe fn contains(&self, base: BasePtr, order: u32, block: usize) -> bool {
        unsafe { self.iter(base, order) }.any(|ofs| ofs == block)
    }

    /// Returns an iterator over the offsets of the blocks in the
    /// order-`order` list, head first.
    ///
    /// # Safety
    ///
    /// Every block in the list must hold an initialized link within `base`,
    /// and the list must not be modified while the iterator is alive.
    pub unsafe fn iter(&self, base: BasePtr, order: u32) -> Iter<'_> {
        Iter {
            base,
            cur: self.head(order),
            _lists: PhantomData,
        }
    }
}

/// An iterator over the offsets of the blocks in one free list.
pub struct Iter<'a> {
    base: BasePtr,
    cur: Option<usize>,
    _lists: PhantomData<&'a FreeLists>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.cur?;

        // SAFETY: the list is unmodified and all of its links are
        // initialized, per the contract of `FreeLists::iter`.
        self.cur = unsafe { self.base.link(cur).next() };

        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::ptr::NonNull;
    use std::{vec, vec::Vec};

    use super::*;

    const ORDER: u32 = 5;

    fn arena(len: usize) -> (Vec<u64>, BasePtr) {
        let mut words = vec![0_u64; len / 8];
        let ptr = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        (words, BasePtr::new(ptr, len))
    }

    fn collect(lists: &FreeLists, base: BasePtr) -> Vec<usize> {
        unsafe { lists.iter(base, ORDER) }.collect()
    }

    #[test]
    fn push_is_lifo() {
        let (_words, base) = arena(128);
        let mut lists = FreeLists::new();

        unsafe {
            lists.push(base, ORDER, 0);
            lists.push(base, ORDER, 64);
            lists.push(base, ORDER, 32);
        }

        assert_eq!(collect(&lists, base), [32, 64, 0]);
        assert_eq!(lists.len(ORDER), 3);
        assert_eq!(unsafe { lists.pop(base, ORDER) }, Some(32));
        assert_eq!(unsafe { base.link(64).prev() }, None);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let (_words, base) = arena(256);
        let mut lists = FreeLists::new();

        for ofs in [0, 32, 64, 96, 128] {
            unsafe { lists.push(base, ORDER, ofs) };
        }

        // [128, 96, 64, 32, 0]
        unsafe {
            lists.remove(base, ORDER, 128);
            assert_eq!(collect(&lists, base), [96, 64, 32, 0]);

            lists.remove(base, ORDER, 64);
            assert_eq!(collect(&lists, base), [96, 32, 0]);
            assert_eq!(base.link(32).prev(), Some(96));

            lists.remove(base, ORDER, 0);
            assert_eq!(collect(&lists, base), [96, 32]);
            assert_eq!(base.link(32).next(), None);

            assert!(lists.contains(base, ORDER, 32));
            assert!(!lists.contains(base, ORDER, 64));
        }

        assert_eq!(lists.len(ORDER), 2);
    }

    #[test]
    fn pop_empty_list() {
        let (_words, base) = arena(64);
        let mut lists = FreeLists::new();

        assert_eq!(unsafe { lists.pop(base, ORDER) }, None);
        assert_eq!(lists.head(ORDER), None);
    }
}
