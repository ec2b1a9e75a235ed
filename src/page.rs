//! Page frames, page descriptors and block-order arithmetic.
//!
//! All buddy arithmetic is carried out on [`Pfn`] values. A block of order `o`
//! covers `2^o` consecutive frames and starts at a frame number that is a
//! multiple of `2^o`; its buddy is the block whose frame number differs only
//! in bit `o`.

use core::fmt;

/// The base-2 logarithm of [`PAGE_SIZE`].
pub const PAGE_BITS: u32 = 12;

/// The size of a single page frame, in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Returns the number of page frames in a block of order `order`.
#[inline]
pub const fn pages_per_block(order: usize) -> usize {
    1 << order
}

/// Returns the smallest order whose blocks hold at least `count` frames.
///
/// Returns `None` if `count` is zero or no such order fits in a `usize`.
pub fn order_for_pages(count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }

    let rounded = count.checked_next_power_of_two()?;
    Some(rounded.trailing_zeros() as usize)
}

/// A page-frame number: the index of a physical page.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pfn(usize);

impl Pfn {
    /// Wraps a raw frame number.
    #[inline]
    pub const fn new(raw: usize) -> Pfn {
        Pfn(raw)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the frame containing the physical address `addr`.
    #[inline]
    pub const fn from_address(addr: usize) -> Pfn {
        Pfn(addr >> PAGE_BITS)
    }

    /// Returns the physical address of the first byte of this frame.
    #[inline]
    pub const fn base_address(self) -> usize {
        self.0 << PAGE_BITS
    }

    /// Returns `true` if a block of order `order` may start at this frame.
    #[inline]
    pub const fn is_aligned(self, order: usize) -> bool {
        self.0 & (pages_per_block(order) - 1) == 0
    }

    /// Rounds this frame number down to a multiple of `2^order`.
    #[inline]
    pub const fn align_down(self, order: usize) -> Pfn {
        Pfn(self.0 & !(pages_per_block(order) - 1))
    }

    /// Returns the head of the buddy of the order-`order` block starting here.
    #[inline]
    pub const fn buddy(self, order: usize) -> Pfn {
        Pfn(self.0 ^ pages_per_block(order))
    }

    /// Returns the frame `pages` frames after this one.
    #[inline]
    pub fn checked_add(self, pages: usize) -> Option<Pfn> {
        self.0.checked_add(pages).map(Pfn)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A page descriptor.
///
/// Descriptors are plain handles: looking one up from a frame number is O(1)
/// and they carry no ownership of the frame itself.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Page {
    pfn: Pfn,
}

impl Page {
    /// Returns the descriptor of the frame `pfn`.
    #[inline]
    pub const fn get_from_pfn(pfn: Pfn) -> Page {
        Page { pfn }
    }

    /// Returns the frame number of this page.
    #[inline]
    pub const fn pfn(self) -> Pfn {
        self.pfn
    }

    /// Returns the physical address of the first byte of this page.
    #[inline]
    pub const fn base_address(self) -> usize {
        self.pfn.base_address()
    }

    /// Returns the physical address of the last byte of the order-`order`
    /// block starting at this page.
    #[inline]
    pub const fn block_last_address(self, order: usize) -> usize {
        self.base_address() + (pages_per_block(order) << PAGE_BITS) - 1
    }

    /// Returns the page `pages` frames after this one.
    ///
    /// # Panics
    ///
    /// Panics if the frame number overflows.
    #[inline]
    pub fn offset(self, pages: usize) -> Page {
        let pfn = self
            .pfn
            .checked_add(pages)
            .expect("page frame number overflowed");
        Page { pfn }
    }
}
