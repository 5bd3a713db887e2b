//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses used by the per-core code: TLB
//! invalidation walks [`VirtualAddress`] ranges page by page, page-directory
//! identity is a [`PhysicalAddress`], and user pointers are checked against the
//! user/kernel split before anything dereferences them.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | Page-table translated address. |
//! | [`PhysicalAddress`] | Physical memory or MMIO. |
//! | [`PageSize`] / [`Size4K`] | Marker for the base page granularity. |
//!
//! ## User space
//!
//! User space is the half-open range
//! [`USER_RANGE_BASE`]`..`[`USER_RANGE_CEILING`]. The first page is never
//! mapped for user code, so null pointers fail the range check.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x1000);
//! assert!(va.is_user());
//! assert!(is_user_range(va, 2 * Size4K::SIZE));
//! assert!(!is_user_range(VirtualAddress::zero(), 8));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::{PageIter, VirtualAddress};

/// Lowest address user code may touch.
pub const USER_RANGE_BASE: u64 = 0x1000;

/// First address above the canonical lower half.
pub const USER_RANGE_CEILING: u64 = 0x0000_8000_0000_0000;

/// Whether `len` bytes starting at `base` lie entirely in user space.
///
/// A zero-length range is accepted when `base` itself is a user address.
/// Ranges that wrap around the address space are rejected.
#[must_use]
pub const fn is_user_range(base: VirtualAddress, len: u64) -> bool {
    if !base.is_user() {
        return false;
    }
    match base.as_u64().checked_add(len) {
        Some(end) => end <= USER_RANGE_CEILING,
        None => false,
    }
}
