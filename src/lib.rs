//! Buddy allocation of physical page frames.
//!
//! [`BuddyPageAllocator`] hands out naturally-aligned runs of `2^order` page
//! frames and coalesces them again when they are freed. Free-list linkage is
//! kept in a side table indexed by page-frame number, so the memory handed to
//! callers is never reinterpreted by the allocator.
//!
//! The allocator does not lock internally. Kernels that share it between
//! cores should use [`SpinBuddyAllocator`](buddy::SpinBuddyAllocator), which
//! places the whole structure behind a single spinlock.

#![doc(html_root_url = "https://docs.rs/page_buddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that
// newer toolchains provide inherently.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

pub mod buddy;
mod links;
pub mod memory;
pub mod page;
mod polyfill;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

pub use crate::{
    buddy::BuddyPageAllocator,
    memory::{NullMemory, PhysicalMemory, Region},
    page::{Page, Pfn, PAGE_BITS, PAGE_SIZE},
};

use crate::polyfill::NonNullStrict;

bitflags::bitflags! {
    /// Options accepted by [`BuddyPageAllocator::allocate_pages`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Zero-fill the returned block before handing it out.
        const ZERO = 1 << 0;
    }
}

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig,

    /// The first frame of the managed range is not aligned to the size of
    /// the largest block.
    ///
    /// Buddies are located by flipping a single bit of the frame number,
    /// which only pairs up the right frames when the range starts on a
    /// largest-block boundary.
    MisalignedBase,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::MisalignedBase => {
                f.write_str("managed range is not aligned to the largest block size")
            }
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// order.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("insufficient memory")
    }
}

/// A pointer to the base of the region of memory backing a range of page
/// frames.
#[derive(Copy, Clone, Debug)]
struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        assert!(
            ptr.addr().get().checked_add(extent).is_some(),
            "region limit overflows usize"
        );

        BasePtr { ptr, extent }
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer. Returns `None`
    /// if `offset` lies outside the region.
    fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.extent {
            return None;
        }

        let raw = self.ptr.addr().get().checked_add(offset)?;
        let addr = NonZeroUsize::new(raw)?;
        Some(self.ptr.with_addr(addr))
    }
}

/// Types which provide memory which backs an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. The caller keeps ownership of that memory.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must be the layout that block was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
