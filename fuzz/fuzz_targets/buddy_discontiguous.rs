#![deny(unsafe_op_in_unsafe_fn)]
#![no_main]

use std::{alloc::Layout, ops::Range, ptr::NonNull};

use alloc_hater::{ArbOrder, Block, Blocks};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use page_buddy::{
    page::pages_per_block, AllocFlags, AllocInitError, BuddyPageAllocator, Page, PhysicalMemory,
    Pfn, Raw, Region, PAGE_SIZE,
};

const ORDERS: usize = 8;

const MAX_BLOCKS: usize = 8;

type Buddy = BuddyPageAllocator<ORDERS, Region<Raw>, Raw>;

#[derive(Clone, Debug, Arbitrary)]
pub enum AllocatorOp {
    Allocate(ArbOrder),
    Deallocate(usize),
    InsertFree(usize),
}

#[derive(Clone, Debug)]
struct Args {
    base_pfn: usize,
    num_frames: usize,
    regions: Vec<Range<usize>>,
    ops: Vec<AllocatorOp>,
}

// Generates arbitrary, non-overlapping frame ranges that can be handed to an
// allocator.
fn regions(un: &mut Unstructured, num_frames: usize) -> arbitrary::Result<Vec<Range<usize>>> {
    let num_bounds = usize::arbitrary(un)? % (num_frames + 1);

    let mut boundaries = Vec::with_capacity(num_bounds);
    for _ in 0..num_bounds {
        let bound = usize::arbitrary(un)? % (num_frames + 1);
        boundaries.push(bound);
    }
    boundaries.sort_unstable();
    boundaries.dedup();

    Ok(boundaries
        .chunks_exact(2)
        .map(|s| s[0]..s[1])
        .collect())
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let max_block = pages_per_block(ORDERS - 1);

        let base_pfn = (usize::arbitrary(un)? % 1024) * max_block;
        let num_frames = usize::arbitrary(un)? % (MAX_BLOCKS * max_block);
        let regions = regions(un, num_frames)?;

        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            base_pfn,
            num_frames,
            regions,
            ops,
        })
    }
}

/// Heap memory owned by the fuzz target on behalf of a `Raw` allocator.
struct RawParts {
    metadata: NonNull<u8>,
    metadata_layout: Layout,
    region: NonNull<u8>,
    region_layout: Layout,
}

fn create_buddy(base_pfn: usize, num_frames: usize) -> Result<(Buddy, RawParts), AllocInitError> {
    if num_frames == 0 {
        return Err(AllocInitError::InvalidConfig);
    }

    let metadata_layout = Buddy::metadata_layout(num_frames).ok_or(AllocInitError::InvalidConfig)?;
    let region_layout =
        Region::<Raw>::region_layout(num_frames).ok_or(AllocInitError::InvalidConfig)?;

    let metadata = NonNull::new(unsafe { std::alloc::alloc(metadata_layout) })
        .ok_or(AllocInitError::AllocFailed(metadata_layout))?;
    let region = NonNull::new(unsafe { std::alloc::alloc(region_layout) }).ok_or_else(|| {
        unsafe { std::alloc::dealloc(metadata.as_ptr(), metadata_layout) };
        AllocInitError::AllocFailed(region_layout)
    })?;

    let parts = RawParts {
        metadata,
        metadata_layout,
        region,
        region_layout,
    };

    let memory = unsafe { Region::new_raw(region, Pfn::new(base_pfn), num_frames) };
    match unsafe { Buddy::new_raw(metadata, memory) } {
        Ok(buddy) => Ok((buddy, parts)),
        Err(e) => {
            unsafe { destroy_parts(parts) };
            Err(e)
        }
    }
}

unsafe fn destroy_parts(parts: RawParts) {
    unsafe {
        std::alloc::dealloc(parts.metadata.as_ptr(), parts.metadata_layout);
        std::alloc::dealloc(parts.region.as_ptr(), parts.region_layout);
    }
}

fuzz_target!(|args: Args| {
    let Args {
        base_pfn,
        num_frames,
        regions,
        ops,
    } = args;

    let (mut buddy, parts) = match create_buddy(base_pfn, num_frames) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut regions = regions;
    let mut seeded = 0;
    let mut outstanding = 0;
    let mut blocks = Blocks::new();
    let mut completed = Vec::new();

    for (op_id, op) in ops.into_iter().enumerate() {
        let op_id: u64 = op_id.try_into().unwrap();
        match op.clone() {
            AllocatorOp::Allocate(ArbOrder(order)) => {
                let page = match buddy.allocate_pages(order, AllocFlags::empty()) {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                assert!(page.pfn().is_aligned(order));

                let ptr = buddy.memory().page_ptr(page).unwrap();
                let ptr = NonNull::slice_from_raw_parts(ptr, pages_per_block(order) * PAGE_SIZE);
                blocks.push(unsafe { Block::init(ptr, order, op_id) });
                outstanding += pages_per_block(order);
            }

            AllocatorOp::Deallocate(idx) => {
                let mut block = match blocks.remove_modulo(idx) {
                    Some(b) => b,
                    None => continue,
                };

                if !block.verify() {
                    panic!("\nblock failed verification.\nnum frames: {num_frames}\ncompleted: {completed:?}\nfailed: {op:?}");
                }

                block.paint(op_id);

                let (ptr, order) = block.into_raw_parts();
                let offset = unsafe { ptr.cast::<u8>().as_ptr().offset_from(parts.region.as_ptr()) };
                let pfn = base_pfn + offset as usize / PAGE_SIZE;
                buddy.free_pages(Page::get_from_pfn(Pfn::new(pfn)), order);
                outstanding -= pages_per_block(order);
            }

            AllocatorOp::InsertFree(idx) => {
                let len = regions.len();

                if len == 0 {
                    continue;
                }

                let idx = idx % len;
                let range = regions.swap_remove(idx);
                let start = Page::get_from_pfn(Pfn::new(base_pfn + range.start));
                buddy.insert_free_pages(start, range.len());
                seeded += range.len();
            }
        }

        buddy.check_invariants();
        assert_eq!(buddy.total_free() + outstanding, seeded);

        completed.push(op);
    }

    drop(buddy);
    unsafe { destroy_parts(parts) };
});
