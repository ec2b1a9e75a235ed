//! The physical memory behind a range of page frames.
//!
//! The buddy allocator never touches page contents on its own; the only time
//! it needs the memory itself is to zero-fill a block when a caller passes
//! [`AllocFlags::ZERO`](crate::AllocFlags::ZERO). That access goes through
//! [`PhysicalMemory`].

use core::{alloc::Layout, fmt, ptr::NonNull};

#[cfg(any(feature = "alloc", test))]
use crate::{AllocInitError, Global};

use crate::{
    page::{Page, Pfn, PAGE_SIZE},
    BackingAllocator, BasePtr, Raw,
};

/// A contiguous range of page frames and access to their backing memory.
///
/// # Safety
///
/// Implementors must uphold the following invariants:
/// - If `page_ptr(page)` returns `Some(ptr)`, then `ptr` must be valid for
///   reads and writes for `PAGE_SIZE` bytes and aligned to `PAGE_SIZE` for as
///   long as `self` exists.
/// - Pointers returned for distinct pages must not overlap.
pub unsafe trait PhysicalMemory {
    /// Returns the first frame of the range.
    fn base_pfn(&self) -> Pfn;

    /// Returns the number of frames in the range.
    fn num_frames(&self) -> usize;

    /// Returns a pointer to the first byte of `page`'s backing memory.
    ///
    /// Returns `None` if `page` is outside the range or its memory is not
    /// addressable.
    fn page_ptr(&self, page: Page) -> Option<NonNull<u8>>;

    /// Returns `true` if `pfn` lies within the range.
    fn contains(&self, pfn: Pfn) -> bool {
        pfn.get()
            .checked_sub(self.base_pfn().get())
            .map_or(false, |idx| idx < self.num_frames())
    }

    /// Fills `count` consecutive pages starting at `first` with zeroes.
    ///
    /// # Panics
    ///
    /// Panics if any of the pages is not addressable.
    fn zero_pages(&mut self, first: Page, count: usize) {
        for i in 0..count {
            let page = first.offset(i);
            let ptr = self
                .page_ptr(page)
                .unwrap_or_else(|| panic!("page {} has no backing memory", page.pfn()));

            // SAFETY: `page_ptr` guarantees PAGE_SIZE writable bytes.
            unsafe { ptr.as_ptr().write_bytes(0, PAGE_SIZE) };
        }
    }
}

/// A frame range with no addressable memory.
///
/// Useful for managing frames the caller cannot map. Zero-filled allocations
/// from a `NullMemory` panic.
#[derive(Clone, Debug)]
pub struct NullMemory {
    base_pfn: Pfn,
    num_frames: usize,
}

impl NullMemory {
    /// Describes `num_frames` frames starting at `base_pfn`.
    pub const fn new(base_pfn: Pfn, num_frames: usize) -> NullMemory {
        NullMemory {
            base_pfn,
            num_frames,
        }
    }
}

// SAFETY: no pointers are ever handed out.
unsafe impl PhysicalMemory for NullMemory {
    fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    fn num_frames(&self) -> usize {
        self.num_frames
    }

    fn page_ptr(&self, _: Page) -> Option<NonNull<u8>> {
        None
    }
}

/// A page-aligned region of memory standing in for a range of page frames.
///
/// The frame numbers are chosen by the caller; frame `base_pfn + i` is backed
/// by the `i`th page of the region.
pub struct Region<A: BackingAllocator> {
    base: BasePtr,
    base_pfn: Pfn,
    num_frames: usize,
    backing_allocator: A,
}

impl<A: BackingAllocator> Region<A> {
    /// Returns the layout requirements of a region of `num_frames` frames.
    ///
    /// Returns `None` if the size overflows.
    pub fn region_layout(num_frames: usize) -> Option<Layout> {
        let size = num_frames.checked_mul(PAGE_SIZE)?;
        Layout::from_size_align(size, PAGE_SIZE).ok()
    }
}

impl Region<Raw> {
    /// Constructs a `Region` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `PAGE_SIZE` and valid for reads and writes for
    /// `num_frames * PAGE_SIZE` bytes for the lifetime of the region. The
    /// memory must not be accessed except through the region while it exists.
    pub unsafe fn new_raw(ptr: NonNull<u8>, base_pfn: Pfn, num_frames: usize) -> Region<Raw> {
        assert_eq!(
            ptr.as_ptr().align_offset(PAGE_SIZE),
            0,
            "region must be page-aligned"
        );
        let extent = num_frames
            .checked_mul(PAGE_SIZE)
            .expect("region size overflows usize");

        Region {
            base: BasePtr::new(ptr, extent),
            base_pfn,
            num_frames,
            backing_allocator: Raw,
        }
    }
}

#[cfg(any(feature = "alloc", test))]
impl Region<Global> {
    /// Allocates a region of `num_frames` frames from the global allocator.
    ///
    /// The region starts out zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `num_frames` is zero or
    /// the region size overflows, and [`AllocInitError::AllocFailed`] if the
    /// global allocator fails.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn new(base_pfn: Pfn, num_frames: usize) -> Result<Region<Global>, AllocInitError> {
        if num_frames == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Self::region_layout(num_frames).ok_or(AllocInitError::InvalidConfig)?;

        // SAFETY: layout size is nonzero.
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
            .ok_or(AllocInitError::AllocFailed(layout))?;

        Ok(Region {
            base: BasePtr::new(ptr, layout.size()),
            base_pfn,
            num_frames,
            backing_allocator: Global,
        })
    }
}

impl<A: BackingAllocator> Region<A> {
    /// Returns the block of `count` pages starting at `first` as a byte slice.
    ///
    /// Returns `None` if any of the pages is outside the region.
    ///
    /// # Safety
    ///
    /// The caller must own the pages, i.e. they must be allocated to the
    /// caller and not be aliased by any other live reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn pages_mut(&self, first: Page, count: usize) -> Option<&mut [u8]> {
        let last = first.pfn().checked_add(count.checked_sub(1)?)?;
        if !self.contains(first.pfn()) || !self.contains(last) {
            return None;
        }

        let ptr = self.page_ptr(first)?;
        let len = count.checked_mul(PAGE_SIZE)?;

        Some(unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }
}

// SAFETY: pages map to disjoint, page-aligned PAGE_SIZE slices of the region.
unsafe impl<A: BackingAllocator> PhysicalMemory for Region<A> {
    fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    fn num_frames(&self) -> usize {
        self.num_frames
    }

    fn page_ptr(&self, page: Page) -> Option<NonNull<u8>> {
        let idx = page.pfn().get().checked_sub(self.base_pfn.get())?;
        if idx >= self.num_frames {
            return None;
        }

        self.base.with_offset(idx.checked_mul(PAGE_SIZE)?)
    }

    fn zero_pages(&mut self, first: Page, count: usize) {
        if count == 0 {
            return;
        }

        // The pages of a region are contiguous, so this is a single fill.
        let bytes = unsafe { self.pages_mut(first, count) }
            .unwrap_or_else(|| panic!("pages {}+{count} lie outside the region", first.pfn()));
        bytes.fill(0);
    }
}

impl<A: BackingAllocator> Drop for Region<A> {
    fn drop(&mut self) {
        if let Some(layout) = Self::region_layout(self.num_frames) {
            unsafe { self.backing_allocator.deallocate(self.base.ptr, layout) };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for Region<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base_pfn", &self.base_pfn)
            .field("num_frames", &self.num_frames)
            .finish_non_exhaustive()
    }
}

// SAFETY: the region exclusively owns its memory.
unsafe impl<A: BackingAllocator + Send> Send for Region<A> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_map_to_consecutive_slices() {
        let region = Region::new(Pfn::new(0x100), 4).unwrap();

        let first = region.page_ptr(Page::get_from_pfn(Pfn::new(0x100))).unwrap();
        let third = region.page_ptr(Page::get_from_pfn(Pfn::new(0x102))).unwrap();
        assert_eq!(
            third.as_ptr() as usize - first.as_ptr() as usize,
            2 * PAGE_SIZE
        );
        assert_eq!(first.as_ptr().align_offset(PAGE_SIZE), 0);

        assert!(region.page_ptr(Page::get_from_pfn(Pfn::new(0xff))).is_none());
        assert!(region.page_ptr(Page::get_from_pfn(Pfn::new(0x104))).is_none());
    }

    #[test]
    fn zero_pages_clears_only_the_requested_pages() {
        let mut region = Region::new(Pfn::new(0), 4).unwrap();
        let all = unsafe { region.pages_mut(Page::get_from_pfn(Pfn::new(0)), 4) }.unwrap();
        all.fill(0xa5);

        region.zero_pages(Page::get_from_pfn(Pfn::new(1)), 2);

        let all = unsafe { region.pages_mut(Page::get_from_pfn(Pfn::new(0)), 4) }.unwrap();
        assert!(all[..PAGE_SIZE].iter().all(|&b| b == 0xa5));
        assert!(all[PAGE_SIZE..3 * PAGE_SIZE].iter().all(|&b| b == 0));
        assert!(all[3 * PAGE_SIZE..].iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn pages_mut_rejects_out_of_range_blocks() {
        let region = Region::new(Pfn::new(8), 4).unwrap();
        unsafe {
            assert!(region.pages_mut(Page::get_from_pfn(Pfn::new(8)), 0).is_none());
            assert!(region.pages_mut(Page::get_from_pfn(Pfn::new(10)), 3).is_none());
            assert!(region.pages_mut(Page::get_from_pfn(Pfn::new(10)), 2).is_some());
        }
    }

    #[test]
    fn empty_region_is_rejected() {
        assert_eq!(
            Region::new(Pfn::new(0), 0).unwrap_err(),
            AllocInitError::InvalidConfig
        );
    }

    #[test]
    #[should_panic(expected = "has no backing memory")]
    fn null_memory_cannot_zero() {
        let mut mem = NullMemory::new(Pfn::new(0), 4);
        mem.zero_pages(Page::get_from_pfn(Pfn::new(0)), 1);
    }
}
