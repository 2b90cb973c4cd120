//! A small library for ~~hating on~~ evaluating the correctness of
//! size-based allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on generated request sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 24;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread evenly across powers of two rather than across the whole
/// `usize` range, which would almost always exceed any arena.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and mask to obtain a size below it.
        let exp = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << exp);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Check,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Request a block with room for this many bytes.
    Alloc(usize),
    /// Release an outstanding block, chosen modulo the number outstanding.
    Dealloc(usize),
    /// Ask the subject to check its own bookkeeping.
    Check,
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Check => AllocatorOp::Check,
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;
    type DeallocError;

    /// Allocates a block with room for at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block whose payload begins at `ptr`.
    ///
    /// Subjects must reject pointers they did not hand out, so this is safe
    /// to call with a dead handle.
    fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::DeallocError>;

    /// Checks the subject's internal consistency, panicking on failure.
    fn check_consistency(&self) {}
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // The usable payload of the block.
    ptr: NonNull<[u8]>,
    // The size originally requested.
    requested: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, requested: usize, id: u64) -> Block {
        let mut b = Block { ptr, requested, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the handle the subject gave out for this block.
    pub fn handle(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Returns whether the block is at least as large as was requested.
    pub fn fits_request(&self) -> bool {
        self.ptr.len() >= self.requested
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: the block was fully painted on creation.
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(&byte, value)| byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

/// Why an evaluation failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A block was smaller than its request.
    TooSmall,
    /// A block's contents changed while it was allocated.
    Corrupted,
    /// A live handle was rejected.
    Rejected,
    /// A dead handle was accepted.
    DoubleFree,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
    pub failure: Failure,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();

            let outcome = match op {
                AllocatorOp::Alloc(size) => match self.subject.allocate(size) {
                    Ok(ptr) => {
                        let block = unsafe { Block::init(ptr, size, op_id) };
                        let fits = block.fits_request();
                        blocks.push(block);
                        fits.then_some(()).ok_or(Failure::TooSmall)
                    }
                    Err(_) => Ok(()),
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(block) => self.release(block),
                    None => Ok(()),
                },

                AllocatorOp::Check => {
                    self.subject.check_consistency();
                    Ok(())
                }
            };

            if let Err(failure) = outcome {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                    failure,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if let Err(failure) = self.release(block) {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    failure,
                });
            }
        }

        self.subject.check_consistency();

        Ok(())
    }

    /// Verifies `block`, then deallocates it twice, expecting only the first
    /// attempt to succeed.
    fn release(&mut self, block: Block) -> Result<(), Failure> {
        if !block.verify() {
            return Err(Failure::Corrupted);
        }

        let handle = block.handle();

        if self.subject.deallocate(handle).is_err() {
            return Err(Failure::Rejected);
        }

        if self.subject.deallocate(handle).is_ok() {
            return Err(Failure::DoubleFree);
        }

        Ok(())
    }
}
