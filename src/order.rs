//! Block order arithmetic.
//!
//! A block of order `k` spans `2^k` bytes and starts at an arena offset that
//! is a multiple of `2^k`. All of the functions here work on offsets from the
//! arena base, never on addresses.

use core::cmp;

use crate::header::HEADER_SIZE;

/// The order of the smallest block in the default configuration (32 bytes).
pub const DEFAULT_MIN_ORDER: u32 = 5;

/// The order of the default arena (1 GiB).
pub const DEFAULT_MAX_ORDER: u32 = 30;

/// Returns the smallest `k` such that `2^k >= n`.
///
/// This is the bit length of `n - 1`, so powers of two map to themselves.
#[inline]
pub const fn ceil_log2(n: usize) -> u32 {
    match n {
        0 | 1 => 0,
        n => usize::BITS - (n - 1).leading_zeros(),
    }
}

/// Returns the order of the block needed to hold `size` payload bytes plus a
/// header, or `None` if no order up to `max_order` suffices.
#[inline]
pub fn order_for_size(size: usize, min_order: u32, max_order: u32) -> Option<u32> {
    if size == 0 {
        return None;
    }

    let needed = size.checked_add(HEADER_SIZE)?;
    let order = cmp::max(ceil_log2(needed), min_order);

    (order <= max_order).then_some(order)
}

/// Returns the size in bytes of a block of order `order`.
#[inline]
pub const fn block_size(order: u32) -> usize {
    1 << order
}

/// Returns the offset of the buddy of the order-`order` block at `ofs`.
#[inline]
pub const fn buddy_of(ofs: usize, order: u32) -> usize {
    ofs ^ block_size(order)
}

/// Returns whether `ofs` is a valid starting offset for an order-`order` block.
#[inline]
pub const fn is_aligned(ofs: usize, order: u32) -> bool {
    ofs & (block_size(order) - 1) == 0
}
