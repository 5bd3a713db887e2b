use crate::{PageSize, USER_RANGE_BASE, USER_RANGE_CEILING};
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;

/// Virtual memory address.
///
/// Carries the *kind* of address at the type level so virtual and physical
/// values can't be mixed. Canonicality is not validated.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    /// Offset of this address within its page of size `S`.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Whether this address lies in user space.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 >= USER_RANGE_BASE && self.0 < USER_RANGE_CEILING
    }

    /// Bases of `count` consecutive pages, starting at the page containing `self`.
    #[inline]
    #[must_use]
    pub const fn pages<S: PageSize>(self, count: usize) -> PageIter<S> {
        PageIter {
            next: self.align_down::<S>().0,
            remaining: count,
            _size: PhantomData,
        }
    }
}

/// Iterator returned by [`VirtualAddress::pages`].
#[derive(Clone, Debug)]
pub struct PageIter<S: PageSize> {
    next: u64,
    remaining: usize,
    _size: PhantomData<S>,
}

impl<S: PageSize> Iterator for PageIter<S> {
    type Item = VirtualAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let base = self.next;
        self.next = self.next.wrapping_add(S::SIZE);
        Some(VirtualAddress(base))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<S: PageSize> ExactSizeIterator for PageIter<S> {}
impl<S: PageSize> FusedIterator for PageIter<S> {}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
