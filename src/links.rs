use core::{alloc::Layout, ptr::NonNull};

use crate::page::Pfn;

/// The allocator's view of a single page frame.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FrameState {
    /// The frame is not the head of a free block. It is allocated, covered by
    /// a larger free block, or was never handed to the allocator.
    Owned,
    /// The frame heads a free block of order `order`; `next` is the following
    /// block on that order's free list.
    Free { order: u8, next: Option<Pfn> },
}

/// Per-frame free-list linkage, indexed by page-frame number.
pub struct LinkTable {
    base: Pfn,
    len: usize,
    map: NonNull<FrameState>,
}

impl LinkTable {
    /// Returns `None` if the table size overflows.
    pub fn map_layout(num_frames: usize) -> Option<Layout> {
        Layout::array::<FrameState>(num_frames).ok()
    }

    /// Constructs a table covering `len` frames starting at `base`, backed by
    /// `map`. Every frame starts out `Owned`.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `LinkTable::map_layout(len)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for `len *
    ///   mem::size_of::<FrameState>()` many bytes, and it must be properly
    ///   aligned.
    /// - `map` must not be accessed except through the returned table for as
    ///   long as the table exists.
    pub unsafe fn new(base: Pfn, len: usize, map: NonNull<FrameState>) -> LinkTable {
        assert!(
            base.get().checked_add(len).is_some(),
            "link table range overflows usize"
        );

        for i in 0..len {
            unsafe { map.as_ptr().add(i).write(FrameState::Owned) };
        }

        LinkTable { base, len, map }
    }

    #[inline]
    pub fn base(&self) -> Pfn {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if `pfn` has an entry in this table.
    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn.get()
            .checked_sub(self.base.get())
            .map_or(false, |idx| idx < self.len)
    }

    #[inline]
    fn index_of(&self, pfn: Pfn) -> usize {
        assert!(self.contains(pfn), "frame {pfn} is outside the link table");
        pfn.get() - self.base.get()
    }

    #[inline]
    pub fn get(&self, pfn: Pfn) -> FrameState {
        let idx = self.index_of(pfn);
        unsafe { self.map.as_ptr().add(idx).read() }
    }

    #[inline]
    pub fn set(&mut self, pfn: Pfn, state: FrameState) {
        let idx = self.index_of(pfn);
        unsafe { self.map.as_ptr().add(idx).write(state) };
    }

    /// Returns the successor of the free block headed by `pfn`.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` does not head a free block.
    #[inline]
    pub fn next(&self, pfn: Pfn) -> Option<Pfn> {
        match self.get(pfn) {
            FrameState::Free { next, .. } => next,
            FrameState::Owned => panic!("frame {pfn} is not linked into a free list"),
        }
    }

    /// Replaces the successor of the free block headed by `pfn`.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` does not head a free block.
    #[inline]
    pub fn set_next(&mut self, pfn: Pfn, new_next: Option<Pfn>) {
        match self.get(pfn) {
            FrameState::Free { order, .. } => self.set(
                pfn,
                FrameState::Free {
                    order,
                    next: new_next,
                },
            ),
            FrameState::Owned => panic!("frame {pfn} is not linked into a free list"),
        }
    }
}
