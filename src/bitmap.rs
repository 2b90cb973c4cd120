//! Occupancy bitmap.
//!
//! One bit per minimum-order slot of the arena. The bit for a slot is set
//! while an occupied block starts there, which lets deallocation reject
//! handles that do not refer to a live block.

use core::{alloc::Layout, mem};

pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of the storage needed for `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u64>(Self::num_words(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` cleared bits, backed by `map`.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for `map_layout(num_bits)`,
    /// and it must not be accessed except through the returned value.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert_eq!(map.align_offset(mem::align_of::<u64>()), 0);

        for i in 0..Self::num_words(num_bits) {
            unsafe { map.add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit % u64::BITS as usize),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(word).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        unsafe {
            let word_ptr = self.map.add(word);
            let bits = word_ptr.read();
            word_ptr.write(match value {
                true => bits | mask,
                false => bits & !mask,
            });
        }
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        (0..Self::num_words(self.num_bits))
            .map(|word| unsafe { self.map.add(word).read() }.count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    fn backing(num_bits: usize) -> Vec<u64> {
        // Garbage, so that `Bitmap::new` has something to clear.
        vec![u64::MAX; Bitmap::num_words(num_bits)]
    }

    #[test]
    fn new_bitmap_is_clear() {
        for num_bits in 1..=130 {
            let mut words = backing(num_bits);
            let bitmap = unsafe { Bitmap::new(num_bits, words.as_mut_ptr()) };

            assert_eq!(bitmap.len(), num_bits);
            assert_eq!(bitmap.count_ones(), 0);
            assert!((0..num_bits).all(|bit| !bitmap.get(bit)));
        }
    }

    #[test]
    fn set_touches_only_its_bit() {
        let mut words = backing(130);
        let mut bitmap = unsafe { Bitmap::new(130, words.as_mut_ptr()) };

        for bit in [0, 63, 64, 129] {
            bitmap.set(bit, true);
        }

        assert_eq!(bitmap.count_ones(), 4);
        assert!(bitmap.get(63) && bitmap.get(64));
        assert!(!bitmap.get(62) && !bitmap.get(65));

        bitmap.set(64, false);
        assert!(!bitmap.get(64));
        assert_eq!(bitmap.count_ones(), 3);
    }

    #[test]
    #[should_panic]
    fn get_out_of_range_panics() {
        let mut words = backing(8);
        let bitmap = unsafe { Bitmap::new(8, words.as_mut_ptr()) };
        bitmap.get(8);
    }
}
