use crate::Backoff;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

/// Token identifying who holds a [`SpinLock`].
///
/// Callers pick the namespace per lock: a core id for per-core state, a
/// thread id for the process-wide lock.
pub type Owner = u64;

const UNOWNED: Owner = Owner::MAX;

/// Test-and-test-and-set spin lock that remembers its holder.
///
/// Re-acquiring the lock with the token that already holds it would spin
/// forever; [`lock`](Self::lock) turns that into an immediate panic naming the
/// owner.
pub struct SpinLock<T> {
    /// Owner token of the holder, or `UNOWNED`.
    owner: AtomicU64,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            owner: AtomicU64::new(UNOWNED),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Spin until acquired, then return a guard.
    ///
    /// # Panics
    /// If `owner` already holds this lock.
    #[inline]
    pub fn lock(&self, owner: Owner) -> SpinLockGuard<'_, T> {
        assert_ne!(owner, UNOWNED, "reserved spin lock owner token");
        let mut backoff = Backoff::new();
        loop {
            match self.owner.compare_exchange_weak(
                UNOWNED,
                owner,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return SpinLockGuard { lock: self },
                Err(holder) if holder == owner => {
                    panic!("spin lock re-acquired by its holder {owner}");
                }
                Err(_) => {
                    // Spin on a read until the lock looks free, then retry the CAS.
                    while self.owner.load(Ordering::Relaxed) != UNOWNED {
                        backoff.spin();
                    }
                }
            }
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, owner: Owner, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock(owner);
        f(&mut g)
    }

    /// Whether anyone holds the lock right now. Advisory only.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNOWNED
    }

    /// Whether `owner` holds the lock right now.
    #[inline]
    #[must_use]
    pub fn is_owned_by(&self, owner: Owner) -> bool {
        self.owner.load(Ordering::Relaxed) == owner
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.owner.store(UNOWNED, Ordering::Release);
    }
}
