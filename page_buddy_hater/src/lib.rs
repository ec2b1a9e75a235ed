#![deny(unsafe_op_in_unsafe_fn)]

use std::{ops::Range, ptr::NonNull};

use alloc_hater::Subject;
use page_buddy::{
    page::pages_per_block, AllocError, AllocFlags, AllocInitError, BuddyPageAllocator, Global,
    Page, PhysicalMemory, Pfn, Region, PAGE_SIZE,
};

/// A buddy allocator over a heap-backed region whose frames start at zero.
pub struct BuddySubject<const ORDERS: usize>(BuddyPageAllocator<ORDERS, Region<Global>, Global>);

impl<const ORDERS: usize> BuddySubject<ORDERS> {
    /// Creates a subject managing `num_frames` frames, all of them free.
    pub fn new(num_frames: usize) -> Result<Self, AllocInitError> {
        Self::new_with_free_ranges(num_frames, [0..num_frames])
    }

    /// Creates a subject managing `num_frames` frames, of which only the
    /// frames in `free_ranges` are free.
    ///
    /// # Panics
    ///
    /// Panics if a range extends past `num_frames` or overlaps another.
    pub fn new_with_free_ranges(
        num_frames: usize,
        free_ranges: impl IntoIterator<Item = Range<usize>>,
    ) -> Result<Self, AllocInitError> {
        let region = Region::new(Pfn::new(0), num_frames)?;
        let mut b = BuddyPageAllocator::try_new(region)?;

        for range in free_ranges {
            b.insert_free_pages(Page::get_from_pfn(Pfn::new(range.start)), range.len());
        }

        Ok(BuddySubject(b))
    }

    pub fn allocator(&self) -> &BuddyPageAllocator<ORDERS, Region<Global>, Global> {
        &self.0
    }

    fn page_of(&self, ptr: NonNull<u8>) -> Page {
        let base = self
            .0
            .memory()
            .page_ptr(Page::get_from_pfn(Pfn::new(0)))
            .expect("region has no first page");

        // SAFETY: `ptr` was handed out by this subject, so it points into the
        // same region as `base`.
        let offset = unsafe { ptr.as_ptr().offset_from(base.as_ptr()) };
        let offset = usize::try_from(offset).expect("pointer precedes the region");

        Page::get_from_pfn(Pfn::new(offset / PAGE_SIZE))
    }
}

impl<const ORDERS: usize> Subject for BuddySubject<ORDERS> {
    type AllocError = AllocError;

    fn allocate(&mut self, order: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        let block = self.0.allocate_pages(order, AllocFlags::empty())?;
        let ptr = self.0.memory().page_ptr(block).ok_or(AllocError)?;

        Ok(NonNull::slice_from_raw_parts(
            ptr,
            pages_per_block(order) * PAGE_SIZE,
        ))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, order: usize) {
        let block = self.page_of(ptr);
        self.0.free_pages(block, order);
    }

    fn is_consistent(&self) -> bool {
        self.0.check_invariants();
        true
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};

    use super::*;

    #[test]
    fn evaluates_a_fixed_sequence() {
        use AllocatorOp::*;

        let subject = BuddySubject::<4>::new_with_free_ranges(32, [1..13, 16..29]).unwrap();
        let seeded = subject.allocator().total_free();
        let mut eval = Evaluator::new(subject);

        let ops = vec![
            Alloc(0),
            Alloc(3),
            Alloc(2),
            Dealloc(1),
            Alloc(1),
            Alloc(9),
            Alloc(3),
            Dealloc(0),
            Alloc(0),
            Dealloc(7),
            Dealloc(2),
        ];
        eval.evaluate(ops).unwrap();

        assert_eq!(eval.into_subject().allocator().total_free(), seeded);
    }

    #[test]
    fn exhausts_and_recovers() {
        let subject = BuddySubject::<3>::new(16).unwrap();
        let mut eval = Evaluator::new(subject);

        let ops = (0..20)
            .map(|_| AllocatorOp::Alloc(0))
            .chain((0..20).map(AllocatorOp::Dealloc));
        eval.evaluate(ops).unwrap();

        assert_eq!(eval.into_subject().allocator().total_free(), 16);
    }
}
