#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use buddy_heap_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MIN_ORDER: u32 = 5;
const MAX_ORDER: u32 = 20;

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let subject = match BuddySubject::<MIN_ORDER, MAX_ORDER>::new() {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(ops) {
        panic!("{:?} after {:?}", failed.failure, failed.completed);
    }

    assert_eq!(
        eval.subject().heap().free_blocks(MAX_ORDER).collect::<Vec<_>>(),
        [0]
    );
});
