//! Access to user memory from system call handlers.
//!
//! Every operation checks the range against the user half of the address
//! space before touching it and runs the access under a [`SmapGuard`]. A
//! fault on a mapped-out page comes back as [`UserCopyError::Fault`]; user
//! pointers never turn into kernel faults.

use crate::errno::Errno;
use alloc::string::String;
use alloc::vec::Vec;
use core::time::Duration;
use kernel_memory_addresses::{VirtualAddress, is_user_range};

/// Read-modify-write operations on a user word, all relaxed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AtomicOp {
    Load,
    Store(u32),
    Exchange(u32),
    FetchAdd(u32),
    CompareExchange { expected: u32, desired: u32 },
    FetchAnd(u32),
    FetchAndNot(u32),
    FetchOr(u32),
    FetchXor(u32),
}

/// Fault-tolerant primitives over user memory.
///
/// # Safety
/// Implementations must survive a fault on any user address and report it as
/// `Err(address)` instead of raising a kernel fault. Callers validate ranges
/// first and hold a [`SmapGuard`] for the duration of every call.
pub unsafe trait UserMemory {
    /// Permit supervisor access to user pages (`stac`).
    fn allow_user_access(&self);

    /// Revoke it again (`clac`).
    fn forbid_user_access(&self);

    fn read(&self, src: VirtualAddress, dst: &mut [u8]) -> Result<(), VirtualAddress>;

    fn write(&self, dst: VirtualAddress, src: &[u8]) -> Result<(), VirtualAddress>;

    fn fill(&self, dst: VirtualAddress, value: u8, len: usize) -> Result<(), VirtualAddress>;

    /// Length of the NUL-terminated string at `src`, looking at no more than
    /// `max` bytes.
    fn strnlen(&self, src: VirtualAddress, max: usize) -> Result<usize, VirtualAddress>;

    /// Apply `op` to the aligned word at `addr`; returns the previous value.
    fn atomic_u32(&self, addr: VirtualAddress, op: AtomicOp) -> Result<u32, VirtualAddress>;
}

/// Supervisor access to user pages for the guard's lifetime.
#[must_use = "user access is revoked when the guard is dropped"]
pub struct SmapGuard<'a, M: UserMemory + ?Sized> {
    memory: &'a M,
}

impl<'a, M: UserMemory + ?Sized> SmapGuard<'a, M> {
    pub fn enter(memory: &'a M) -> Self {
        memory.allow_user_access();
        Self { memory }
    }
}

impl<M: UserMemory + ?Sized> Drop for SmapGuard<'_, M> {
    fn drop(&mut self) {
        self.memory.forbid_user_access();
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UserCopyError {
    #[error("{len:#x} bytes at {base} are not in user space")]
    NotUserRange { base: VirtualAddress, len: usize },
    #[error("fault accessing user memory at {fault_at}")]
    Fault { fault_at: VirtualAddress },
}

impl From<UserCopyError> for Errno {
    fn from(_: UserCopyError) -> Self {
        Self::EFAULT
    }
}

fn check_range(base: VirtualAddress, len: usize) -> Result<(), UserCopyError> {
    let in_range = u64::try_from(len).is_ok_and(|len| is_user_range(base, len));
    if in_range {
        Ok(())
    } else {
        Err(UserCopyError::NotUserRange { base, len })
    }
}

const fn fault(fault_at: VirtualAddress) -> UserCopyError {
    UserCopyError::Fault { fault_at }
}

/// # Errors
/// If `src..src + dst.len()` is not user memory or the copy faults.
pub fn copy_from_user<M: UserMemory + ?Sized>(
    memory: &M,
    dst: &mut [u8],
    src: VirtualAddress,
) -> Result<(), UserCopyError> {
    check_range(src, dst.len())?;
    let _smap = SmapGuard::enter(memory);
    memory.read(src, dst).map_err(fault)
}

/// # Errors
/// If `dst..dst + src.len()` is not user memory or the copy faults.
pub fn copy_to_user<M: UserMemory + ?Sized>(
    memory: &M,
    dst: VirtualAddress,
    src: &[u8],
) -> Result<(), UserCopyError> {
    check_range(dst, src.len())?;
    let _smap = SmapGuard::enter(memory);
    memory.write(dst, src).map_err(fault)
}

/// # Errors
/// If `dst..dst + len` is not user memory or the write faults.
pub fn memset_user<M: UserMemory + ?Sized>(
    memory: &M,
    dst: VirtualAddress,
    value: u8,
    len: usize,
) -> Result<(), UserCopyError> {
    check_range(dst, len)?;
    let _smap = SmapGuard::enter(memory);
    memory.fill(dst, value, len).map_err(fault)
}

/// Copy a string of at most `max_len` bytes, stopping at the first NUL.
///
/// # Errors
/// `EFAULT` if the range is not user memory or reading it faults, `ENOMEM`
/// if the kernel copy cannot be allocated, `EINVAL` if it is not UTF-8.
pub fn copy_string_from_user<M: UserMemory + ?Sized>(
    memory: &M,
    src: VirtualAddress,
    max_len: usize,
) -> Result<String, Errno> {
    check_range(src, max_len)?;
    let len = {
        let _smap = SmapGuard::enter(memory);
        memory.strnlen(src, max_len).map_err(fault)?
    };

    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|_| Errno::ENOMEM)?;
    bytes.resize(len, 0);
    copy_from_user(memory, &mut bytes, src)?;
    String::from_utf8(bytes).map_err(|_| Errno::EINVAL)
}

/// Layout of a user time value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeFormat {
    /// `struct timespec`: seconds, nanoseconds.
    Timespec,
    /// `struct timeval`: seconds, microseconds.
    Timeval,
}

const NANOS_PER_SEC: i64 = 1_000_000_000;
const MICROS_PER_SEC: i64 = 1_000_000;

/// Read a 16-byte `timespec` or `timeval` from user memory.
///
/// # Errors
/// `EFAULT` if the value cannot be read, `EINVAL` if a field is negative or
/// the sub-second part is out of range.
pub fn copy_time_from_user<M: UserMemory + ?Sized>(
    memory: &M,
    src: VirtualAddress,
    format: TimeFormat,
) -> Result<Duration, Errno> {
    let mut raw = [0u8; 16];
    copy_from_user(memory, &mut raw, src)?;
    let (sec, frac) = raw.split_at(8);
    let sec = i64::from_le_bytes(sec.try_into().map_err(|_| Errno::EFAULT)?);
    let frac = i64::from_le_bytes(frac.try_into().map_err(|_| Errno::EFAULT)?);

    let (limit, scale) = match format {
        TimeFormat::Timespec => (NANOS_PER_SEC, 1),
        TimeFormat::Timeval => (MICROS_PER_SEC, 1_000),
    };
    if !(0..limit).contains(&frac) {
        return Err(Errno::EINVAL);
    }
    let sec = u64::try_from(sec).map_err(|_| Errno::EINVAL)?;
    let nanos = u32::try_from(frac * scale).map_err(|_| Errno::EINVAL)?;
    Ok(Duration::new(sec, nanos))
}

fn user_atomic<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    op: AtomicOp,
) -> Option<u32> {
    if !addr.as_u64().is_multiple_of(4) || !is_user_range(addr, 4) {
        return None;
    }
    let _smap = SmapGuard::enter(memory);
    memory.atomic_u32(addr, op).ok()
}

/// `None` unless `addr` is an aligned user word that can be read.
#[must_use]
pub fn user_atomic_load_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::Load)
}

/// Returns whether the store happened.
#[must_use]
pub fn user_atomic_store_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> bool {
    user_atomic(memory, addr, AtomicOp::Store(value)).is_some()
}

#[must_use]
pub fn user_atomic_exchange_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::Exchange(value))
}

#[must_use]
pub fn user_atomic_fetch_add_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::FetchAdd(value))
}

/// Store `desired` if the word holds `*expected`; otherwise load the current
/// value into `expected`. Returns whether the store happened, `None` if the
/// word could not be accessed.
#[must_use]
pub fn user_atomic_compare_exchange_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    expected: &mut u32,
    desired: u32,
) -> Option<bool> {
    let op = AtomicOp::CompareExchange {
        expected: *expected,
        desired,
    };
    let previous = user_atomic(memory, addr, op)?;
    if previous == *expected {
        Some(true)
    } else {
        *expected = previous;
        Some(false)
    }
}

#[must_use]
pub fn user_atomic_fetch_and_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::FetchAnd(value))
}

#[must_use]
pub fn user_atomic_fetch_and_not_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::FetchAndNot(value))
}

#[must_use]
pub fn user_atomic_fetch_or_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::FetchOr(value))
}

#[must_use]
pub fn user_atomic_fetch_xor_relaxed<M: UserMemory + ?Sized>(
    memory: &M,
    addr: VirtualAddress,
    value: u32,
) -> Option<u32> {
    user_atomic(memory, addr, AtomicOp::FetchXor(value))
}

impl AtomicOp {
    /// The value the word holds after applying `self` to `current`.
    #[must_use]
    pub const fn apply(self, current: u32) -> u32 {
        match self {
            Self::Load => current,
            Self::Store(v) | Self::Exchange(v) => v,
            Self::FetchAdd(v) => current.wrapping_add(v),
            Self::CompareExchange { expected, desired } => {
                if current == expected {
                    desired
                } else {
                    current
                }
            }
            Self::FetchAnd(v) => current & v,
            Self::FetchAndNot(v) => current & !v,
            Self::FetchOr(v) => current | v,
            Self::FetchXor(v) => current ^ v,
        }
    }
}
