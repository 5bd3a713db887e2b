//! # Kernel synchronization primitives
//!
//! Two building blocks shared by the per-core code:
//!
//! - [`Backoff`]: bounded exponential pause-hint spinning for CAS retry loops.
//! - [`SpinLock`]: a TATAS lock tagged with its holder, so re-entry by the
//!   same core or thread is caught instead of deadlocking.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod backoff;
mod spin_lock;

pub use backoff::{Backoff, SPIN_LIMIT};
pub use spin_lock::{Owner, SpinLock, SpinLockGuard};
