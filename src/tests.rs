#![cfg(test)]
extern crate std;

use core::ops::Range;

use crate::{
    memory::{PhysicalMemory, Region},
    page::{pages_per_block, Page, Pfn},
    AllocFlags, AllocInitError, BuddyPageAllocator, Global,
};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

type Subject<const ORDERS: usize> = BuddyPageAllocator<ORDERS, Region<Global>, Global>;

fn page(pfn: usize) -> Page {
    Page::get_from_pfn(Pfn::new(pfn))
}

fn snapshot<const ORDERS: usize>(allocator: &Subject<ORDERS>) -> Vec<Vec<Page>> {
    (0..ORDERS)
        .map(|order| allocator.free_blocks(order).collect())
        .collect()
}

// Allocator parameters =========================================================

/// The shape of an allocator under test: the frames it manages and the
/// ranges of those frames that are handed to it as free.
#[derive(Clone, Debug)]
struct BuddyParams<const ORDERS: usize> {
    base_pfn: usize,
    num_frames: usize,
    /// Free ranges, as offsets from `base_pfn`. Sorted and disjoint.
    free_ranges: Vec<Range<usize>>,
}

impl<const ORDERS: usize> Arbitrary for BuddyParams<ORDERS> {
    fn arbitrary(g: &mut Gen) -> Self {
        let max_block = pages_per_block(ORDERS - 1);
        let base_pfn = (usize::arbitrary(g) % 16) * max_block;
        let num_frames = 1 + usize::arbitrary(g) % (4 * max_block);

        let free_ranges = {
            let mut v: Vec<usize> = Vec::<usize>::arbitrary(g)
                .into_iter()
                .map(|ofs| ofs % (num_frames + 1))
                .take(2 + usize::arbitrary(g) % 8)
                .collect();

            v.sort_unstable();
            v.dedup();

            v.chunks_exact(2).map(|pair| pair[0]..pair[1]).collect()
        };

        BuddyParams {
            base_pfn,
            num_frames,
            free_ranges,
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut items = Vec::with_capacity(self.free_ranges.len());
        for i in 0..self.free_ranges.len() {
            let mut free_ranges = self.free_ranges.clone();
            free_ranges.remove(i);

            items.push(BuddyParams {
                base_pfn: self.base_pfn,
                num_frames: self.num_frames,
                free_ranges,
            });
        }

        Box::new(items.into_iter())
    }
}

// Operations ===================================================================

#[derive(Clone, Debug)]
struct AllocParams {
    order: usize,
    zero: bool,
}

impl Arbitrary for AllocParams {
    fn arbitrary(g: &mut Gen) -> Self {
        AllocParams {
            // Deliberately exceeds the last order of the smaller allocators.
            order: usize::arbitrary(g) % 8,
            zero: bool::arbitrary(g),
        }
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of the given order.
    Allocate { params: AllocParams },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                params: AllocParams::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct Allocation {
    op_id: OpId,
    block: Page,
    order: usize,
}

// Properties ===================================================================

trait Prop {
    /// Examines a block just after it was allocated.
    fn post_allocate(memory: &Region<Global>, op_id: OpId, params: &AllocParams, block: Page) -> bool {
        let _ = (memory, op_id, params, block);
        true
    }

    /// Examines a block just before it is freed.
    fn pre_deallocate(memory: &Region<Global>, allocation: &Allocation) -> bool {
        let _ = (memory, allocation);
        true
    }
}

/// Every run checks the free-list invariants, frame conservation and genuine
/// exhaustion; properties add checks on the allocated blocks themselves.
struct Baseline;

impl Prop for Baseline {}

/// Blocks are aligned to their order and lie within the managed range.
struct Aligned;

impl Prop for Aligned {
    fn post_allocate(memory: &Region<Global>, _: OpId, params: &AllocParams, block: Page) -> bool {
        let last = block.pfn().get() + pages_per_block(params.order) - 1;

        block.pfn().is_aligned(params.order)
            && block.pfn() >= memory.base_pfn()
            && last < memory.base_pfn().get() + memory.num_frames()
    }
}

/// No two outstanding blocks share a frame: each block is painted with the
/// id of the operation that allocated it, and the paint must survive until
/// the block is freed.
struct MutuallyExclusive;

fn paint(memory: &Region<Global>, block: Page, order: usize, op_id: OpId) {
    let bytes = unsafe { memory.pages_mut(block, pages_per_block(order)) }.unwrap();
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&op_id.to_le_bytes());
    }
}

fn is_painted(memory: &Region<Global>, block: Page, order: usize, op_id: OpId) -> bool {
    let bytes = unsafe { memory.pages_mut(block, pages_per_block(order)) }.unwrap();
    bytes
        .chunks_exact(4)
        .all(|chunk| chunk == op_id.to_le_bytes())
}

impl Prop for MutuallyExclusive {
    fn post_allocate(memory: &Region<Global>, op_id: OpId, params: &AllocParams, block: Page) -> bool {
        paint(memory, block, params.order, op_id);
        true
    }

    fn pre_deallocate(memory: &Region<Global>, allocation: &Allocation) -> bool {
        is_painted(
            memory,
            allocation.block,
            allocation.order,
            allocation.op_id,
        )
    }
}

/// Blocks requested with `AllocFlags::ZERO` are zero-filled, even when their
/// frames were dirtied by an earlier allocation.
struct ZeroedOnRequest;

impl Prop for ZeroedOnRequest {
    fn post_allocate(memory: &Region<Global>, _: OpId, params: &AllocParams, block: Page) -> bool {
        let bytes = unsafe { memory.pages_mut(block, pages_per_block(params.order)) }.unwrap();
        let zeroed = !params.zero || bytes.iter().all(|&b| b == 0);

        bytes.fill(0xa5);
        zeroed
    }
}

// Checker ======================================================================

struct AllocatorChecker<const ORDERS: usize> {
    allocator: Subject<ORDERS>,
    allocations: Vec<Allocation>,
    /// Free lists right after seeding.
    seeded: Vec<Vec<Page>>,
    seeded_frames: usize,
    outstanding_frames: usize,
    num_ops: u32,
}

impl<const ORDERS: usize> AllocatorChecker<ORDERS> {
    fn new(params: BuddyParams<ORDERS>, capacity: usize) -> Result<Self, AllocInitError> {
        let region = Region::new(Pfn::new(params.base_pfn), params.num_frames)?;
        let mut allocator = Subject::<ORDERS>::try_new(region)?;

        for range in params.free_ranges {
            allocator.insert_free_pages(page(params.base_pfn + range.start), range.len());
            allocator.check_invariants();
        }

        let seeded_frames = allocator.total_free();

        Ok(AllocatorChecker {
            seeded: snapshot(&allocator),
            seeded_frames,
            allocator,
            allocations: Vec::with_capacity(capacity),
            outstanding_frames: 0,
            num_ops: 0,
        })
    }

    fn do_op<P: Prop>(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { params } => {
                let flags = if params.zero {
                    AllocFlags::ZERO
                } else {
                    AllocFlags::empty()
                };

                match self.allocator.allocate_pages(params.order, flags) {
                    Ok(block) => {
                        if !P::post_allocate(self.allocator.memory(), op_id, &params, block) {
                            return false;
                        }

                        self.outstanding_frames += pages_per_block(params.order);
                        self.allocations.push(Allocation {
                            op_id,
                            block,
                            order: params.order,
                        });
                    }

                    // Failure is only allowed when nothing large enough is free.
                    Err(_) => {
                        let exhausted = (params.order..ORDERS)
                            .all(|order| self.allocator.free_blocks(order).next().is_none());
                        if !exhausted {
                            return false;
                        }
                    }
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(self.allocator.memory(), &a) {
                    return false;
                }

                self.allocator.free_pages(a.block, a.order);
                self.outstanding_frames -= pages_per_block(a.order);
            }
        }

        self.allocator.check_invariants();
        self.allocator.total_free() + self.outstanding_frames == self.seeded_frames
    }

    fn run<P: Prop>(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op::<P>(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !P::pre_deallocate(self.allocator.memory(), &a) {
                return false;
            }

            self.allocator.free_pages(a.block, a.order);
        }

        self.allocator.check_invariants();

        // Coalescing is eager, so releasing everything must restore the exact
        // free lists produced by seeding.
        snapshot(&self.allocator) == self.seeded
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

fn check<P: Prop, const ORDERS: usize>(params: BuddyParams<ORDERS>, ops: Vec<AllocatorOp>) -> bool {
    let mut checker = AllocatorChecker::new(params, ops.len()).unwrap();
    checker.run::<P>(ops)
}

#[test]
fn free_lists_stay_consistent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Baseline, 1> as fn(_, _) -> bool);
    qc.quickcheck(check::<Baseline, 3> as fn(_, _) -> bool);
    qc.quickcheck(check::<Baseline, 6> as fn(_, _) -> bool);
}

#[test]
fn allocations_are_aligned() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Aligned, 2> as fn(_, _) -> bool);
    qc.quickcheck(check::<Aligned, 5> as fn(_, _) -> bool);
}

#[test]
fn allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive, 1> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive, 4> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive, 6> as fn(_, _) -> bool);
}

#[test]
fn zeroed_allocations_are_zero_filled() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<ZeroedOnRequest, 3> as fn(_, _) -> bool);
    qc.quickcheck(check::<ZeroedOnRequest, 5> as fn(_, _) -> bool);
}

#[test]
fn every_seeded_frame_can_be_allocated() {
    let region = Region::new(Pfn::new(64), 48).unwrap();
    let mut allocator = Subject::<4>::try_new(region).unwrap();
    allocator.insert_free_pages(page(65), 10);
    allocator.insert_free_pages(page(80), 17);
    allocator.insert_free_pages(page(100), 3);
    let seeded = snapshot(&allocator);
    assert_eq!(allocator.total_free(), 30);

    let mut blocks = Vec::new();
    while let Ok(block) = allocator.allocate_pages(0, AllocFlags::empty()) {
        blocks.push(block);
    }

    assert_eq!(blocks.len(), 30);
    assert_eq!(allocator.total_free(), 0);

    let mut pfns: Vec<usize> = blocks.iter().map(|b| b.pfn().get()).collect();
    pfns.sort_unstable();
    let expected: Vec<usize> = (65..75).chain(80..97).chain(100..103).collect();
    assert_eq!(pfns, expected);

    for block in blocks {
        allocator.free_pages(block, 0);
    }

    allocator.check_invariants();
    assert_eq!(snapshot(&allocator), seeded);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
