#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use page_buddy_hater::BuddySubject;

const ORDERS: usize = 8;

const MAX_FRAMES: usize = 1024;

#[derive(Clone, Debug)]
struct Args {
    num_frames: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        Ok(Args {
            num_frames: usize::arbitrary(un)? % MAX_FRAMES,
            ops: Vec::arbitrary(un)?,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::<ORDERS>::new(args.num_frames) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!(
            "\nblock failed verification.\nnum frames: {}\ncompleted: {:?}\nfailed: {:?}",
            args.num_frames, failed.completed, failed.failed_op
        );
    }

    let subject = eval.into_subject();
    assert_eq!(subject.allocator().total_free(), args.num_frames);
});
