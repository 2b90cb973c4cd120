#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_heap::{AllocInitError, BuddyAllocator, DeallocError, Global};

pub struct BuddySubject<const MIN_ORDER: u32, const MAX_ORDER: u32>(
    BuddyAllocator<MIN_ORDER, MAX_ORDER, Global>,
);

impl<const MIN_ORDER: u32, const MAX_ORDER: u32> BuddySubject<MIN_ORDER, MAX_ORDER> {
    pub fn new() -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new()?;
        Ok(BuddySubject(b))
    }

    pub fn heap(&self) -> &BuddyAllocator<MIN_ORDER, MAX_ORDER, Global> {
        &self.0
    }
}

impl<const MIN_ORDER: u32, const MAX_ORDER: u32> Subject for BuddySubject<MIN_ORDER, MAX_ORDER> {
    type AllocError = buddy_heap::AllocError;
    type DeallocError = DeallocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate_bytes(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::DeallocError> {
        self.0.deallocate(ptr)
    }

    fn check_consistency(&self) {
        self.0.check_free_lists();
        self.0.verify_tiling();
    }
}
