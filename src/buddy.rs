//! Binary-buddy allocation of physical page frames.
//!
//! A buddy allocator keeps one free list per *order*. A block of order `o`
//! spans `2^o` page frames and starts on a frame number that is a multiple of
//! `2^o`. Larger blocks are split in half on demand to satisfy smaller
//! requests, and a freed block is merged with its buddy, the other half of
//! its parent, for as long as that buddy is also free.
//!
//! Each free list is kept sorted by frame number, which makes duplicate
//! insertions detectable and keeps [`BuddyPageAllocator::dump`] output
//! reproducible. The list links live in a side table with one entry per
//! managed frame, so the allocator never writes to the pages themselves
//! except to zero-fill a block on request.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                   |
//! |--------------------------|-----------|------------------------------|
//! | Allocate                 | O(1)      | O(orders × free list length) |
//! | Deallocate               | O(1)      | O(orders × free list length) |
//! | Seed `n` frames          | O(1)      | O(n × orders × list length)  |
//!
//! #### Fragmentation
//!
//! Buddy allocators exhibit limited internal and external fragmentation.
//! Allocations are made in whole blocks, so requests that are not a power of
//! two pages waste the remainder. Coalescing is eager, so free memory is
//! always held in the fewest, largest blocks its layout permits.
//!
//! ## Invariants
//!
//! Before and after every public operation:
//! - a frame heads at most one free block;
//! - every head on the order-`o` list is aligned to `2^o`;
//! - every list is sorted by ascending frame number;
//! - [`total_free`](BuddyPageAllocator::total_free) equals the number of
//!   frames on all free lists;
//! - no two buddies are free at the same order.
//!
//! Contract violations, such as freeing a block twice or freeing a
//! misaligned block, panic rather than continue with a corrupted free list.

use core::{alloc::Layout, cell::RefCell, fmt, ptr::NonNull};

use log::{debug, info, trace};
use spin::Mutex as SpinMutex;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    links::{FrameState, LinkTable},
    memory::PhysicalMemory,
    page::{pages_per_block, Page, Pfn, PAGE_BITS},
    AllocError, AllocFlags, AllocInitError, BackingAllocator, Raw,
};

/// Declares a wrapper which places a `BuddyPageAllocator` behind an
/// interior-mutability type and forwards the public operations through `&self`.
macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ident via $method:ident)*) => {
        $(
            #[doc = concat!("A `BuddyPageAllocator` wrapped by a `", stringify!($typename), "`.")]
            ///
            /// Every operation holds the wrapper for its whole duration, so
            /// splits and merges are never observed half-done.
            $(#[$attr])*
            pub struct $wrapper<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> {
                inner: $typename<BuddyPageAllocator<ORDERS, M, A>>,
            }

            impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> $wrapper<ORDERS, M, A> {
                /// Wraps `allocator`.
                pub const fn new(allocator: BuddyPageAllocator<ORDERS, M, A>) -> Self {
                    $wrapper {
                        inner: $typename::new(allocator),
                    }
                }

                /// Returns a reference to the inner wrapper.
                pub fn inner(&self) -> &$typename<BuddyPageAllocator<ORDERS, M, A>> {
                    &self.inner
                }

                /// Unwraps the allocator.
                pub fn into_inner(self) -> BuddyPageAllocator<ORDERS, M, A> {
                    self.inner.into_inner()
                }

                /// See [`BuddyPageAllocator::allocate_pages`].
                pub fn allocate_pages(&self, order: usize, flags: AllocFlags) -> Result<Page, AllocError> {
                    self.inner.$method().allocate_pages(order, flags)
                }

                /// See [`BuddyPageAllocator::free_pages`].
                pub fn free_pages(&self, block: Page, order: usize) {
                    self.inner.$method().free_pages(block, order)
                }

                /// See [`BuddyPageAllocator::insert_free_pages`].
                pub fn insert_free_pages(&self, range_start: Page, page_count: usize) {
                    self.inner.$method().insert_free_pages(range_start, page_count)
                }

                /// See [`BuddyPageAllocator::total_free`].
                pub fn total_free(&self) -> usize {
                    self.inner.$method().total_free()
                }

                /// See [`BuddyPageAllocator::dump`].
                pub fn dump(&self) {
                    self.inner.$method().dump()
                }
            }

            impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> fmt::Debug
                for $wrapper<ORDERS, M, A>
            {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($wrapper)).finish_non_exhaustive()
                }
            }
        )*
    };
}

declare_wrappers! {
    SpinBuddyAllocator uses SpinMutex via lock
    RefCellBuddyAllocator uses RefCell via borrow_mut
}

/// A binary-buddy allocator over a fixed range of page frames.
///
/// `ORDERS` is the number of block orders; blocks range from one page (order
/// zero) to `2^(ORDERS - 1)` pages (order [`LAST_ORDER`]). The managed frame
/// range is taken from the [`PhysicalMemory`] passed at construction, and
/// must start on a frame aligned to the largest block size.
///
/// The allocator starts out empty. Frames become available through
/// [`insert_free_pages`], usually once during boot for every range of
/// physical memory that is not otherwise reserved.
///
/// For example, an allocator with blocks from 4 KiB up to 4 MiB:
///
/// ```
/// use page_buddy::{AllocFlags, BuddyPageAllocator, NullMemory, Page, Pfn};
///
/// # #[cfg(not(feature = "alloc"))]
/// # fn main() {}
/// # #[cfg(feature = "alloc")]
/// # fn main() -> Result<(), page_buddy::AllocInitError> {
/// let memory = NullMemory::new(Pfn::new(0), 4096);
/// let mut buddy = BuddyPageAllocator::<11, _, _>::try_new(memory)?;
///
/// buddy.insert_free_pages(Page::get_from_pfn(Pfn::new(0)), 4096);
/// assert_eq!(buddy.total_free(), 4096);
///
/// let block = buddy.allocate_pages(2, AllocFlags::empty()).unwrap();
/// assert!(block.pfn().is_aligned(2));
/// assert_eq!(buddy.total_free(), 4092);
///
/// buddy.free_pages(block, 2);
/// assert_eq!(buddy.total_free(), 4096);
/// # Ok(())
/// # }
/// ```
///
/// [`LAST_ORDER`]: Self::LAST_ORDER
/// [`insert_free_pages`]: Self::insert_free_pages
pub struct BuddyPageAllocator<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> {
    memory: M,
    links: LinkTable,
    /// Head of each order's free list.
    free_lists: [Option<Pfn>; ORDERS],
    total_free: usize,
    /// Backing storage for `links`.
    metadata: NonNull<u8>,
    backing_allocator: A,
}

/// One past the highest frame number whose byte addresses fit in a `usize`.
const MAX_PFN_END: usize = 1 << (usize::BITS - PAGE_BITS);

impl<const ORDERS: usize, M: PhysicalMemory> BuddyPageAllocator<ORDERS, M, Raw> {
    /// Constructs a new `BuddyPageAllocator` whose frame table lives in
    /// caller-provided memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `ORDERS` is zero or too large for the address
    /// space, if `memory` is empty, or if its first frame is not aligned to
    /// the largest block size.
    ///
    /// # Safety
    ///
    /// `metadata` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Self::metadata_layout(memory.num_frames())`], and it
    /// must be valid for reads and writes for the entire size indicated by
    /// that `Layout` for as long as the allocator exists.
    ///
    /// [`Self::metadata_layout(memory.num_frames())`]: Self::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        memory: M,
    ) -> Result<BuddyPageAllocator<ORDERS, M, Raw>, AllocInitError> {
        Self::check_config(&memory)?;

        unsafe { Ok(Self::from_parts(metadata, memory, Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const ORDERS: usize, M: PhysicalMemory> BuddyPageAllocator<ORDERS, M, Global> {
    /// Constructs a new `BuddyPageAllocator` whose frame table is allocated
    /// from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `ORDERS` is zero or too large for the address
    /// space, if `memory` is empty, if its first frame is not aligned to the
    /// largest block size, or if the frame table cannot be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(memory: M) -> Result<BuddyPageAllocator<ORDERS, M, Global>, AllocInitError> {
        Self::check_config(&memory)?;

        let layout =
            Self::metadata_layout(memory.num_frames()).ok_or(AllocInitError::InvalidConfig)?;

        unsafe {
            // SAFETY: `check_config` rejects empty ranges, so the layout has a
            // nonzero size.
            let metadata = NonNull::new(alloc::alloc::alloc(layout))
                .ok_or(AllocInitError::AllocFailed(layout))?;

            Ok(Self::from_parts(metadata, memory, Global))
        }
    }
}

impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> Drop
    for BuddyPageAllocator<ORDERS, M, A>
{
    fn drop(&mut self) {
        // Construction rejects ranges whose table layout overflows.
        if let Some(layout) = Self::metadata_layout(self.links.len()) {
            unsafe { self.backing_allocator.deallocate(self.metadata, layout) };
        }
    }
}

impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> BuddyPageAllocator<ORDERS, M, A> {
    /// The largest order this allocator hands out.
    pub const LAST_ORDER: usize = ORDERS.saturating_sub(1);

    /// Returns the layout requirements of the frame table for an allocator
    /// managing `num_frames` frames.
    ///
    /// Returns `None` if the size of the table overflows.
    pub fn metadata_layout(num_frames: usize) -> Option<Layout> {
        LinkTable::map_layout(num_frames)
    }

    fn check_config(memory: &M) -> Result<(), AllocInitError> {
        if ORDERS == 0 || ORDERS > (usize::BITS - PAGE_BITS) as usize {
            return Err(AllocInitError::InvalidConfig);
        }

        let num_frames = memory.num_frames();
        let base_pfn = memory.base_pfn();

        // Every frame in the range must have a representable byte address.
        let addressable = base_pfn
            .checked_add(num_frames)
            .map_or(false, |end| end.get() <= MAX_PFN_END);

        if num_frames == 0 || !addressable || Self::metadata_layout(num_frames).is_none() {
            return Err(AllocInitError::InvalidConfig);
        }

        if !base_pfn.is_aligned(Self::LAST_ORDER) {
            return Err(AllocInitError::MisalignedBase);
        }

        Ok(())
    }

    /// # Safety
    ///
    /// `metadata` must satisfy `Self::metadata_layout(memory.num_frames())`
    /// and be exclusively owned by the returned allocator.
    unsafe fn from_parts(metadata: NonNull<u8>, memory: M, backing_allocator: A) -> Self {
        let links = unsafe { LinkTable::new(memory.base_pfn(), memory.num_frames(), metadata.cast()) };

        BuddyPageAllocator {
            memory,
            links,
            free_lists: [None; ORDERS],
            total_free: 0,
            metadata,
            backing_allocator,
        }
    }

    /// Returns the largest order this allocator hands out.
    #[inline]
    pub const fn last_order(&self) -> usize {
        Self::LAST_ORDER
    }

    /// Returns the first frame of the managed range.
    #[inline]
    pub fn base_pfn(&self) -> Pfn {
        self.links.base()
    }

    /// Returns the number of frames in the managed range.
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.links.len()
    }

    /// Returns the number of free frames.
    #[inline]
    pub fn total_free(&self) -> usize {
        self.total_free
    }

    /// Returns a reference to the memory backing the managed frames.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Returns a mutable reference to the memory backing the managed frames.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Returns an iterator over the blocks on the order-`order` free list, in
    /// ascending frame order.
    ///
    /// # Panics
    ///
    /// Panics if `order` exceeds [`LAST_ORDER`](Self::LAST_ORDER).
    pub fn free_blocks(&self, order: usize) -> FreeBlocks<'_> {
        Self::assert_order(order);

        FreeBlocks {
            links: &self.links,
            next: self.free_lists[order],
        }
    }

    /// Returns a displayable snapshot of every free list.
    ///
    /// Each order is rendered on its own line as `[<order>]` followed by the
    /// inclusive physical extents of its blocks, in hex.
    pub fn free_lists(&self) -> FreeLists<'_, ORDERS, M, A> {
        FreeLists { allocator: self }
    }

    /// Logs the state of every free list at `info` level.
    pub fn dump(&self) {
        info!("*** buddy page allocator - free list ***");

        for order in 0..ORDERS {
            info!(
                "{}",
                FreeListLine {
                    order,
                    blocks: self.free_blocks(order),
                }
            );
        }
    }

    #[inline]
    fn assert_order(order: usize) {
        assert!(
            order < ORDERS,
            "order {order} exceeds the last order {}",
            Self::LAST_ORDER
        );
    }

    /// Returns `true` if the order-`order` block at `pfn` lies wholly inside
    /// the managed range.
    fn contains_block(&self, order: usize, pfn: Pfn) -> bool {
        self.links.contains(pfn)
            && pfn
                .checked_add(pages_per_block(order) - 1)
                .map_or(false, |last| self.links.contains(last))
    }

    fn assert_block(&self, order: usize, block: Page) {
        Self::assert_order(order);

        let pfn = block.pfn();
        assert!(
            pfn.is_aligned(order),
            "block {pfn} is misaligned for order {order}"
        );
        assert!(
            self.contains_block(order, pfn),
            "order {order} block {pfn} lies outside the managed range"
        );
    }

    /// Inserts `block` into the order-`order` free list, keeping the list
    /// sorted.
    ///
    /// # Panics
    ///
    /// Panics if `order` is out of range, `block` is misaligned or outside
    /// the managed range, or `block` already heads a free block.
    pub(crate) fn insert_free_block(&mut self, order: usize, block: Page) {
        self.assert_block(order, block);

        let target = block.pfn();
        assert!(
            self.links.get(target) == FrameState::Owned,
            "block {target} is already on a free list"
        );

        let mut prev = None;
        let mut cur = self.free_lists[order];
        while let Some(c) = cur {
            if c >= target {
                break;
            }

            prev = Some(c);
            cur = self.links.next(c);
        }

        assert_ne!(cur, Some(target), "block {target} inserted twice");

        self.links.set(
            target,
            FrameState::Free {
                order: order as u8,
                next: cur,
            },
        );

        match prev {
            Some(p) => self.links.set_next(p, Some(target)),
            None => self.free_lists[order] = Some(target),
        }
    }

    /// Unlinks `block` from the order-`order` free list.
    ///
    /// # Panics
    ///
    /// Panics if `order` is out of range, `block` is misaligned, or `block` is
    /// not on the list.
    pub(crate) fn remove_free_block(&mut self, order: usize, block: Page) {
        self.assert_block(order, block);

        let target = block.pfn();

        let mut prev = None;
        let mut cur = self.free_lists[order];
        while let Some(c) = cur {
            if c >= target {
                break;
            }

            prev = Some(c);
            cur = self.links.next(c);
        }

        assert_eq!(
            cur,
            Some(target),
            "block {target} is not on the order {order} free list"
        );

        let next = self.links.next(target);
        match prev {
            Some(p) => self.links.set_next(p, next),
            None => self.free_lists[order] = next,
        }

        self.links.set(target, FrameState::Owned);
    }

    /// Returns `true` if `page` heads a block on the order-`order` free list.
    ///
    /// Frames outside the managed range are never free.
    pub(crate) fn is_in_free_list(&self, order: usize, page: Page) -> bool {
        Self::assert_order(order);

        let pfn = page.pfn();
        if !self.links.contains(pfn) {
            return false;
        }

        matches!(
            self.links.get(pfn),
            FrameState::Free { order: o, .. } if o as usize == order
        )
    }

    /// Splits the free order-`order` block at `block` into two free halves of
    /// order `order - 1`.
    ///
    /// # Panics
    ///
    /// Panics if `order` is zero or `block` is not free at `order`.
    pub(crate) fn split_block(&mut self, order: usize, block: Page) {
        assert!(order > 0, "cannot split an order 0 block");

        self.remove_free_block(order, block);

        let lower = order - 1;
        let right = block.offset(pages_per_block(lower));

        trace!(
            "split order {order} block {} into {} and {}",
            block.pfn(),
            block.pfn(),
            right.pfn()
        );

        self.insert_free_block(lower, block);
        self.insert_free_block(lower, right);
    }

    /// Merges the free order-`order` block at `one_buddy` with its buddy and
    /// returns the head of the merged order-`order + 1` block.
    ///
    /// # Panics
    ///
    /// Panics if `order` is the last order, or if either buddy is not free at
    /// `order`.
    pub(crate) fn merge_buddies(&mut self, order: usize, one_buddy: Page) -> Page {
        assert!(
            order < Self::LAST_ORDER,
            "cannot merge blocks of the last order {order}"
        );

        let pfn = one_buddy.pfn();
        let other = Page::get_from_pfn(pfn.buddy(order));
        assert!(
            self.is_in_free_list(order, other),
            "cannot merge order {order} block {pfn}: buddy {} is not free",
            other.pfn()
        );

        self.remove_free_block(order, one_buddy);
        self.remove_free_block(order, other);

        let merged = Page::get_from_pfn(pfn.align_down(order + 1));
        trace!(
            "merged order {order} buddies {} and {} into {}",
            pfn,
            other.pfn(),
            merged.pfn()
        );

        self.insert_free_block(order + 1, merged);
        merged
    }

    /// Returns the order of the free block covering `pfn`, if any.
    fn free_order_of(&self, pfn: Pfn) -> Option<usize> {
        (0..ORDERS).find(|&order| self.is_in_free_list(order, Page::get_from_pfn(pfn.align_down(order))))
    }

    /// Returns the first frame inside the order-`order` block at `block` that
    /// heads a free block.
    ///
    /// This scans every frame of the block.
    fn free_head_within(&self, order: usize, block: Page) -> Option<Page> {
        (0..pages_per_block(order))
            .map(|i| block.offset(i))
            .find(|page| matches!(self.links.get(page.pfn()), FrameState::Free { .. }))
    }

    /// Allocates a block of `2^order` frames.
    ///
    /// The smallest free block of at least the requested order is taken and
    /// split down as needed; the returned block is always aligned to
    /// `2^order` frames. If `flags` contains [`AllocFlags::ZERO`], the block
    /// is zero-filled through the backing memory before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError)`, leaving the allocator unchanged, if `order`
    /// exceeds [`LAST_ORDER`](Self::LAST_ORDER) or no block of at least
    /// `order` is free.
    pub fn allocate_pages(&mut self, order: usize, flags: AllocFlags) -> Result<Page, AllocError> {
        if order > Self::LAST_ORDER {
            debug!("rejecting allocation of order {order}");
            return Err(AllocError);
        }

        let (found, head) = (order..ORDERS)
            .find_map(|o| self.free_lists[o].map(|head| (o, head)))
            .ok_or_else(|| {
                debug!("no free block of order {order} or above");
                AllocError
            })?;

        let block = Page::get_from_pfn(head);
        self.remove_free_block(found, block);

        // Split the block repeatedly to obtain a suitably sized block. The
        // front half keeps the block's frame number; the back half is freed.
        for lower in (order..found).rev() {
            let back_half = block.offset(pages_per_block(lower));
            trace!("split order {} block {head}, freeing {}", lower + 1, back_half.pfn());
            self.insert_free_block(lower, back_half);
        }

        self.total_free -= pages_per_block(order);

        if flags.contains(AllocFlags::ZERO) {
            self.memory.zero_pages(block, pages_per_block(order));
        }

        debug!("allocated order {order} block {head}");
        Ok(block)
    }

    /// Returns a block of `2^order` frames to the allocator and merges it
    /// with its buddies for as long as they are free.
    ///
    /// # Panics
    ///
    /// Panics if `order` is out of range, if `block` is misaligned or
    /// outside the managed range, or if `block` is already free, either on
    /// its own or as part of a larger free block. Debug builds also panic if
    /// any smaller block inside `block` is free.
    pub fn free_pages(&mut self, block: Page, order: usize) {
        self.assert_block(order, block);

        if let Some(free_order) = self.free_order_of(block.pfn()) {
            panic!(
                "double free of order {order} block {}: already free at order {free_order}",
                block.pfn()
            );
        }

        debug_assert!(
            self.free_head_within(order, block).is_none(),
            "double free of order {order} block {}: frame {} is already free",
            block.pfn(),
            self.free_head_within(order, block).map_or(block.pfn(), Page::pfn)
        );

        self.insert_free_block(order, block);
        self.total_free += pages_per_block(order);

        let mut block = block;
        let mut order = order;
        while order < Self::LAST_ORDER {
            let buddy = Page::get_from_pfn(block.pfn().buddy(order));
            if !self.is_in_free_list(order, buddy) {
                break;
            }

            block = self.merge_buddies(order, block);
            order += 1;
        }
    }

    /// Hands `page_count` frames starting at `range_start` to the allocator.
    ///
    /// The range is carved into the fewest naturally-aligned blocks that
    /// cover it exactly: at each step the largest block that is aligned at
    /// the cursor and fits in the remaining count is freed. Blocks merge with
    /// any free buddies as they are inserted.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie within the managed range, or if one
    /// of the blocks it is carved into is already free.
    pub fn insert_free_pages(&mut self, range_start: Page, page_count: usize) {
        if page_count == 0 {
            return;
        }

        let start = range_start.pfn();
        let in_range = start
            .checked_add(page_count - 1)
            .map_or(false, |last| self.links.contains(start) && self.links.contains(last));
        assert!(
            in_range,
            "range {start}+{page_count} lies outside the managed range"
        );

        let mut cursor = range_start;
        let mut remaining = page_count;
        while remaining > 0 {
            let order = (0..ORDERS)
                .rev()
                .find(|&o| cursor.pfn().is_aligned(o) && pages_per_block(o) <= remaining)
                .unwrap_or(0);

            debug!("seeding order {order} block {}", cursor.pfn());
            self.free_pages(cursor, order);

            let step = pages_per_block(order);
            remaining -= step;
            if remaining > 0 {
                cursor = cursor.offset(step);
            }
        }
    }

    /// Verifies every free-list invariant.
    ///
    /// This walks the whole frame table and is intended for tests and
    /// debugging.
    ///
    /// # Panics
    ///
    /// Panics with a description of the first violated invariant.
    pub fn check_invariants(&self) {
        let mut listed_heads = 0;
        let mut listed_frames = 0;

        for order in 0..ORDERS {
            let mut prev: Option<Pfn> = None;

            for block in self.free_blocks(order) {
                let pfn = block.pfn();
                listed_heads += 1;
                listed_frames += pages_per_block(order);

                assert!(pfn.is_aligned(order), "order {order} head {pfn} misaligned");
                assert!(
                    self.contains_block(order, pfn),
                    "order {order} block {pfn} outside the managed range"
                );
                assert!(
                    prev.map_or(true, |p| p < pfn),
                    "order {order} free list out of order at {pfn}"
                );
                assert!(
                    self.is_in_free_list(order, block),
                    "order {order} head {pfn} is not tagged with its order"
                );

                if order < Self::LAST_ORDER {
                    let buddy = Page::get_from_pfn(pfn.buddy(order));
                    assert!(
                        !self.is_in_free_list(order, buddy),
                        "order {order} buddies {pfn} and {} are both free",
                        buddy.pfn()
                    );
                }

                // A free block must not lie inside a larger free block.
                for outer in order + 1..ORDERS {
                    let outer_head = Page::get_from_pfn(pfn.align_down(outer));
                    assert!(
                        !self.is_in_free_list(outer, outer_head),
                        "order {order} block {pfn} overlaps free order {outer} block {}",
                        outer_head.pfn()
                    );
                }

                prev = Some(pfn);
            }
        }

        let tagged_heads = (0..self.links.len())
            .filter(|&idx| {
                let pfn = Pfn::new(self.links.base().get() + idx);
                matches!(self.links.get(pfn), FrameState::Free { .. })
            })
            .count();

        assert_eq!(
            tagged_heads, listed_heads,
            "frame table and free lists disagree on the number of free blocks"
        );
        assert_eq!(
            self.total_free, listed_frames,
            "free frame count does not match the free lists"
        );
    }
}

impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> fmt::Debug
    for BuddyPageAllocator<ORDERS, M, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyPageAllocator")
            .field("orders", &ORDERS)
            .field("base_pfn", &self.links.base())
            .field("num_frames", &self.links.len())
            .field("total_free", &self.total_free)
            .finish_non_exhaustive()
    }
}

// SAFETY: the allocator exclusively owns its frame table; the only shared
// state is reachable through `memory` and `backing_allocator`.
unsafe impl<const ORDERS: usize, M, A> Send for BuddyPageAllocator<ORDERS, M, A>
where
    M: PhysicalMemory + Send,
    A: BackingAllocator + Send,
{
}

/// An iterator over the blocks on one free list.
///
/// Created by [`BuddyPageAllocator::free_blocks`].
#[derive(Clone)]
pub struct FreeBlocks<'a> {
    links: &'a LinkTable,
    next: Option<Pfn>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        let cur = self.next?;
        self.next = self.links.next(cur);
        Some(Page::get_from_pfn(cur))
    }
}

impl fmt::Debug for FreeBlocks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBlocks")
            .field("next", &self.next)
            .finish()
    }
}

struct FreeListLine<'a> {
    order: usize,
    blocks: FreeBlocks<'a>,
}

impl fmt::Display for FreeListLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:02}]", self.order)?;

        for block in self.blocks.clone() {
            write!(
                f,
                " {:x}--{:x}",
                block.base_address(),
                block.block_last_address(self.order)
            )?;
        }

        Ok(())
    }
}

/// A displayable snapshot of every free list.
///
/// Created by [`BuddyPageAllocator::free_lists`].
pub struct FreeLists<'a, const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> {
    allocator: &'a BuddyPageAllocator<ORDERS, M, A>,
}

impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> fmt::Display
    for FreeLists<'_, ORDERS, M, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for order in 0..ORDERS {
            let line = FreeListLine {
                order,
                blocks: self.allocator.free_blocks(order),
            };
            writeln!(f, "{line}")?;
        }

        Ok(())
    }
}

impl<const ORDERS: usize, M: PhysicalMemory, A: BackingAllocator> fmt::Debug
    for FreeLists<'_, ORDERS, M, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
