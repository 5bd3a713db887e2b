//! # Lock-free message slot pool
//!
//! All cross-core messages live in one fixed array of slots, sized at boot
//! from the core count. Free slots form a Treiber stack threaded through the
//! slots themselves. The stack head packs a generation tag next to the top
//! index; every successful push or pop bumps the tag, so a compare-and-swap
//! against a head that was popped and pushed back in the meantime fails
//! instead of corrupting the list.
//!
//! Each slot also carries one delivery link per core. Delivering a message to
//! core `n` threads the slot onto `n`'s [`PendingQueue`] through link `n`, so a
//! broadcast enqueues the same slot on every other core without allocating.
//!
//! Links and heads store `index + 1`; zero terminates a list.

use crate::message::Message;
use crate::CoreId;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_sync::Backoff;

/// Slots provisioned per core.
pub const MESSAGES_PER_CORE: usize = 100;

const END: u32 = 0;

/// Handle to an acquired slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct MessageId(u32);

impl MessageId {
    const fn index(self) -> usize {
        self.0 as usize
    }

    const fn link(self) -> u32 {
        self.0 + 1
    }

    const fn from_link(link: u32) -> Option<Self> {
        match link.checked_sub(1) {
            Some(index) => Some(Self(index)),
            None => None,
        }
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[inline]
fn pack(tag: u32, link: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(link)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

struct Slot {
    next_free: AtomicU32,
    /// Receivers that have not finished with the message yet.
    refs: AtomicU32,
    is_async: AtomicBool,
    payload: UnsafeCell<Option<Message>>,
    /// Next delivery in core `n`'s pending queue.
    links: Box<[AtomicU32]>,
}

pub struct MessagePool {
    slots: Box<[Slot]>,
    free_head: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

// Safety: a payload is written only by the slot's acquirer before it is
// published, read by receivers while it is in flight, and dropped by whoever
// observes the last reference. The atomics around it order those phases.
unsafe impl Sync for MessagePool {}

impl MessagePool {
    /// A pool of `capacity` free slots, each deliverable to `cores` cores.
    ///
    /// # Panics
    /// If `capacity` does not fit the 32-bit link encoding.
    #[must_use]
    pub fn new(capacity: usize, cores: usize) -> Self {
        let Ok(last) = u32::try_from(capacity) else {
            panic!("message pool of {capacity} slots exceeds link range");
        };
        assert!(last < u32::MAX, "message pool of {capacity} slots exceeds link range");

        let slots: Vec<Slot> = (0..last)
            .map(|index| Slot {
                // slot i links to i + 1; the last one terminates the stack
                next_free: AtomicU32::new(if index + 1 < last { index + 2 } else { END }),
                refs: AtomicU32::new(0),
                is_async: AtomicBool::new(false),
                payload: UnsafeCell::new(None),
                links: (0..cores).map(|_| AtomicU32::new(END)).collect(),
            })
            .collect();

        let top = if last == 0 { END } else { 1 };
        Self {
            slots: slots.into_boxed_slice(),
            free_head: AtomicU64::new(pack(0, top)),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently held by senders or in flight. Exact only when no
    /// acquire or release is running concurrently.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        let released = self.released.load(Ordering::Acquire);
        let acquired = self.acquired.load(Ordering::Acquire);
        acquired.saturating_sub(released)
    }

    #[must_use]
    pub fn acquired_total(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn released_total(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    fn slot(&self, id: MessageId) -> &Slot {
        &self.slots[id.index()]
    }

    /// Pop a free slot, or `None` if the pool is exhausted.
    pub(crate) fn try_acquire(&self) -> Option<MessageId> {
        let mut backoff = Backoff::new();
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            let id = MessageId::from_link(top)?;
            // May be stale if another core pops `id` first; the tag makes the CAS fail then.
            let next = self.slot(id).next_free.load(Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return Some(id);
                }
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Pop a free slot, calling `while_empty` between retries until one frees up.
    ///
    /// Senders pass a closure that drains their own pending queue, so two
    /// cores starving each other of slots still make progress.
    pub(crate) fn acquire(&self, mut while_empty: impl FnMut()) -> MessageId {
        let mut backoff = Backoff::new();
        loop {
            if let Some(id) = self.try_acquire() {
                return id;
            }
            while_empty();
            backoff.spin();
        }
    }

    /// Push `id` back onto the free stack. Its payload must already be gone.
    pub(crate) fn release(&self, id: MessageId) {
        let slot = self.slot(id);
        debug_assert!(
            // Safety: the releaser is the only party still referencing the slot.
            unsafe { (*slot.payload.get()).is_none() },
            "message {id} released with a payload"
        );
        let mut backoff = Backoff::new();
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            slot.next_free.store(top, Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), id.link()),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.released.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Install the payload and delivery bookkeeping of a slot about to be sent.
    ///
    /// # Safety
    /// `id` must have been acquired by the caller and not yet enqueued anywhere.
    pub(crate) unsafe fn prepare(&self, id: MessageId, message: Message, refs: u32, is_async: bool) {
        let slot = self.slot(id);
        // Safety: unpublished slot, exclusively owned by the caller.
        unsafe { *slot.payload.get() = Some(message) };
        slot.is_async.store(is_async, Ordering::Relaxed);
        slot.refs.store(refs, Ordering::Relaxed);
    }

    /// Shared view of an in-flight payload.
    ///
    /// # Safety
    /// The caller must be a receiver of `id` that has not dropped its
    /// reference yet, or the sender waiting on it.
    pub(crate) unsafe fn payload(&self, id: MessageId) -> Option<&Message> {
        // Safety: nobody mutates the payload while references are outstanding.
        unsafe { (*self.slot(id).payload.get()).as_ref() }
    }

    /// Move the payload out so the slot can be released.
    ///
    /// # Safety
    /// No receiver may still hold a reference to `id`.
    pub(crate) unsafe fn take_payload(&self, id: MessageId) -> Option<Message> {
        // Safety: exclusive by contract.
        unsafe { (*self.slot(id).payload.get()).take() }
    }

    pub(crate) fn is_async(&self, id: MessageId) -> bool {
        self.slot(id).is_async.load(Ordering::Relaxed)
    }

    /// References still outstanding on `id`.
    pub(crate) fn refs(&self, id: MessageId) -> u32 {
        self.slot(id).refs.load(Ordering::Acquire)
    }

    /// Drop one receiver reference; returns the count before the decrement.
    ///
    /// # Panics
    /// If the slot has no outstanding references.
    pub(crate) fn release_ref(&self, id: MessageId) -> u32 {
        match self.slot(id).refs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
            refs.checked_sub(1)
        }) {
            Ok(previous) => previous,
            Err(_) => panic!("message {id} completed with no outstanding receivers"),
        }
    }

    /// Prepend the delivery of `id` to `target`'s queue.
    ///
    /// Returns whether the queue was empty before, i.e. whether `target`
    /// needs an interrupt to notice.
    pub(crate) fn enqueue(&self, queue: &PendingQueue, target: CoreId, id: MessageId) -> bool {
        let link = &self.slot(id).links[target as usize];
        let mut backoff = Backoff::new();
        let mut next = queue.head.load(Ordering::Relaxed);
        loop {
            link.store(next, Ordering::Relaxed);
            match queue.head.compare_exchange_weak(
                next,
                id.link(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next == END,
                Err(current) => {
                    next = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach everything queued for `target` and yield it oldest first.
    pub(crate) fn take_all(&self, queue: &PendingQueue, target: CoreId) -> Deliveries<'_> {
        let target = target as usize;
        let mut list = queue.head.swap(END, Ordering::Acquire);

        // Senders prepend, so the detached list is newest first; reverse it.
        let mut reversed = END;
        while let Some(id) = MessageId::from_link(list) {
            let link = &self.slot(id).links[target];
            list = link.load(Ordering::Relaxed);
            link.store(reversed, Ordering::Relaxed);
            reversed = id.link();
        }

        Deliveries {
            pool: self,
            target,
            next: reversed,
        }
    }
}

/// Per-core list of deliveries awaiting processing.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    head: AtomicU32,
}

impl PendingQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicU32::new(END),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == END
    }
}

/// Deliveries detached by [`MessagePool::take_all`].
///
/// The link to the following delivery is read before a slot is handed out,
/// so the caller may complete (and thereby free) each slot as it goes.
pub(crate) struct Deliveries<'a> {
    pool: &'a MessagePool,
    target: usize,
    next: u32,
}

impl Iterator for Deliveries<'_> {
    type Item = MessageId;

    fn next(&mut self) -> Option<MessageId> {
        let id = MessageId::from_link(self.next)?;
        self.next = self.pool.slot(id).links[self.target].load(Ordering::Relaxed);
        Some(id)
    }
}
