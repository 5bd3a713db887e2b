//! # Deferred calls
//!
//! Work queued on a core to run the next time it leaves its outermost
//! critical section outside of interrupt context, or on the way out of a
//! trap. Entries come from a small per-core pool; when the pool runs dry a
//! heap entry is used instead and freed once it has run.

use crate::platform::{InterruptDisabler, Platform};
use crate::{Core, CoreId};
use alloc::boxed::Box;
use kernel_sync::SpinLock;
use log::debug;

/// Pool entries pre-allocated per core.
pub const DEFERRED_POOL_SIZE: usize = 5;

type DeferredFn = Box<dyn FnOnce() + Send + 'static>;

struct DeferredEntry {
    handler: Option<DeferredFn>,
    next: Option<Box<Self>>,
    /// Heap overflow entry rather than a pool entry.
    was_allocated: bool,
}

impl DeferredEntry {
    fn new(was_allocated: bool) -> Box<Self> {
        Box::new(Self {
            handler: None,
            next: None,
            was_allocated,
        })
    }
}

#[derive(Default)]
struct Lists {
    free: Option<Box<DeferredEntry>>,
    pending: Option<Box<DeferredEntry>>,
    free_count: usize,
}

impl Lists {
    fn with_pool() -> Self {
        let mut lists = Self::default();
        for _ in 0..DEFERRED_POOL_SIZE {
            lists.push_free(DeferredEntry::new(false));
        }
        lists
    }

    fn push_free(&mut self, mut entry: Box<DeferredEntry>) {
        entry.next = self.free.take();
        self.free = Some(entry);
        self.free_count += 1;
    }

    fn pop_free(&mut self) -> Option<Box<DeferredEntry>> {
        let mut entry = self.free.take()?;
        self.free = entry.next.take();
        self.free_count -= 1;
        Some(entry)
    }
}

pub(crate) struct DeferredQueue {
    lists: SpinLock<Lists>,
}

impl DeferredQueue {
    pub(crate) fn new() -> Self {
        Self {
            lists: SpinLock::new(Lists::with_pool()),
        }
    }

    /// Drop anything pending and refill the pool.
    pub(crate) fn reset(&self, owner: CoreId) {
        let stale = {
            let mut lists = self.lists.lock(owner.into());
            core::mem::replace(&mut *lists, Lists::with_pool())
        };
        drop(stale);
    }

    fn push(&self, owner: CoreId, handler: DeferredFn) -> bool {
        let mut lists = self.lists.lock(owner.into());
        let (mut entry, overflow) = match lists.pop_free() {
            Some(entry) => (entry, false),
            None => (DeferredEntry::new(true), true),
        };
        entry.handler = Some(handler);
        entry.next = lists.pending.take();
        lists.pending = Some(entry);
        overflow
    }

    /// Detach the pending list, oldest first.
    fn take_pending(&self, owner: CoreId) -> Option<Box<DeferredEntry>> {
        let mut list = self.lists.lock(owner.into()).pending.take();

        let mut reversed: Option<Box<DeferredEntry>> = None;
        while let Some(mut entry) = list {
            list = entry.next.take();
            entry.next = reversed;
            reversed = Some(entry);
        }
        reversed
    }

    fn recycle(&self, owner: CoreId, entry: Box<DeferredEntry>) {
        if entry.was_allocated {
            return;
        }
        self.lists.lock(owner.into()).push_free(entry);
    }

    pub(crate) fn free_count(&self, owner: CoreId) -> usize {
        self.lists.with_lock(owner.into(), |lists| lists.free_count)
    }

    pub(crate) fn has_pending(&self, owner: CoreId) -> bool {
        self.lists.with_lock(owner.into(), |lists| lists.pending.is_some())
    }
}

impl<P: Platform> Core<'_, P> {
    /// Queue `callback` to run when this core next leaves its outermost
    /// critical section (outside interrupt context) or returns from a trap.
    ///
    /// Called outside any critical section the callback runs before this
    /// returns.
    pub fn deferred_call_queue(&self, callback: impl FnOnce() + Send + 'static) {
        let _critical = self.critical();
        let _irq = InterruptDisabler::new(self.platform());
        if self.deferred().push(self.id(), Box::new(callback)) {
            debug!("CPU[{}]: deferred call pool exhausted, using heap entry", self.id());
        }
    }

    /// Run every pending deferred call in the order it was queued.
    ///
    /// # Panics
    /// If called outside a critical section.
    pub fn deferred_call_execute_pending(&self) {
        assert!(
            self.in_critical() > 0,
            "CPU[{}]: deferred calls must run inside a critical section",
            self.id()
        );

        let mut list = self.deferred().take_pending(self.id());
        while let Some(mut entry) = list {
            list = entry.next.take();
            if let Some(handler) = entry.handler.take() {
                handler();
            }
            self.deferred().recycle(self.id(), entry);
        }
    }

    /// Pool entries not currently holding a queued call.
    #[must_use]
    pub fn deferred_pool_available(&self) -> usize {
        let _irq = InterruptDisabler::new(self.platform());
        self.deferred().free_count(self.id())
    }

    #[must_use]
    pub fn has_deferred_calls(&self) -> bool {
        let _irq = InterruptDisabler::new(self.platform());
        self.deferred().has_pending(self.id())
    }
}
