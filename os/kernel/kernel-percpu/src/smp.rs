//! # Inter-processor messaging
//!
//! A sender takes a slot from the shared [`MessagePool`](crate::MessagePool),
//! fills it, threads it onto each receiver's pending queue and raises the
//! messaging interrupt on receivers whose queue was empty. Receivers drain
//! their queue from the interrupt path ([`Core::exit_trap`]) and complete
//! each message by dropping their reference.
//!
//! Synchronous sends spin until every receiver has completed, draining the
//! sender's own queue meanwhile so two cores messaging each other cannot
//! deadlock. The last receiver of an asynchronous message releases the slot.

use crate::error::SmpError;
use crate::message::Message;
use crate::message_pool::MessageId;
use crate::platform::{Arch, InterruptDisabler, PageDirectoryId, Platform};
use crate::{Core, CoreId};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_sync::{Backoff, SpinLock};
use log::{debug, trace};

impl<P: Platform> Core<'_, P> {
    fn check_target(&self, target: CoreId) -> Result<(), SmpError> {
        if !self.processors.is_smp_enabled() {
            return Err(SmpError::NotEnabled);
        }
        if target == self.id() {
            return Err(SmpError::SelfTarget { core: target });
        }
        if self.processors.get(target).is_none() {
            return Err(SmpError::NoSuchCore {
                core: target,
                count: self.processors.count(),
            });
        }
        Ok(())
    }

    /// Take a slot, draining our own queue while the pool is exhausted.
    fn acquire_message(&self) -> MessageId {
        self.pool().acquire(|| {
            if self.processors.is_smp_enabled() {
                self.smp_process_pending_messages();
            }
        })
    }

    /// Spin until every receiver completed `id`, then free it.
    fn wait_and_release(&self, id: MessageId) {
        let pool = self.pool();
        let mut backoff = Backoff::new();
        while pool.refs(id) != 0 {
            // Serve our own queue so a peer waiting on us is not stuck.
            if self.processor.has_pending_messages() {
                self.smp_process_pending_messages();
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
        // Safety: all receivers are done and the slot was never async.
        drop(unsafe { pool.take_payload(id) });
        pool.release(id);
    }

    fn unicast_message(&self, target: CoreId, id: MessageId, is_async: bool) {
        let receiver = &self.processors[target];
        trace!("SMP[{}]: unicast message {id} to core {target}", self.id());
        if self.pool().enqueue(&receiver.pending, target, id) {
            self.platform().send_ipi(target);
        }
        // The receiver may already have released an async slot.
        if !is_async {
            self.wait_and_release(id);
        }
    }

    fn broadcast_message(&self, id: MessageId, is_async: bool) {
        let mut need_ipi = false;
        for receiver in self.processors.iter().filter(|p| p.id() != self.id()) {
            need_ipi |= self.pool().enqueue(&receiver.pending, receiver.id(), id);
        }
        trace!("SMP[{}]: broadcast message {id}", self.id());
        if need_ipi {
            self.platform().broadcast_ipi(self.id());
        }
        if !is_async {
            self.wait_and_release(id);
        }
    }

    /// Run `callback` on core `target`.
    ///
    /// With `is_async` false this returns only after `target` has run it.
    ///
    /// # Errors
    /// Before messaging is enabled, or if `target` is this core or does not exist.
    pub fn smp_unicast(
        &self,
        target: CoreId,
        callback: impl Fn() + Send + Sync + 'static,
        is_async: bool,
    ) -> Result<(), SmpError> {
        self.check_target(target)?;
        let id = self.acquire_message();
        // Safety: freshly acquired, not yet published.
        unsafe { self.pool().prepare(id, Message::Callback(Box::new(callback)), 1, is_async) };
        self.unicast_message(target, id, is_async);
        Ok(())
    }

    /// Run `callback` once on every other core.
    ///
    /// On a single-core system nothing is sent.
    ///
    /// # Errors
    /// Before messaging is enabled.
    pub fn smp_broadcast(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
        is_async: bool,
    ) -> Result<(), SmpError> {
        if !self.processors.is_smp_enabled() {
            return Err(SmpError::NotEnabled);
        }
        let receivers = self.processors.count() - 1;
        if receivers == 0 {
            return Ok(());
        }
        let id = self.acquire_message();
        // Safety: freshly acquired, not yet published.
        unsafe {
            self.pool().prepare(
                id,
                Message::Callback(Box::new(callback)),
                receiver_count(receivers),
                is_async,
            );
        };
        self.broadcast_message(id, is_async);
        Ok(())
    }

    /// Run `f` on `target` and return its result.
    ///
    /// # Errors
    /// As for [`smp_unicast`](Self::smp_unicast).
    pub fn run_on<R, F>(&self, target: CoreId, f: F) -> Result<R, SmpError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let owner = u64::from(target);
        let job = Arc::new(SpinLock::new(Some(f)));
        let result = Arc::new(SpinLock::new(None));
        {
            let result = Arc::clone(&result);
            self.smp_unicast(
                target,
                move || {
                    let f = job.lock(owner).take();
                    if let Some(f) = f {
                        let value = f();
                        *result.lock(owner) = Some(value);
                    }
                },
                false,
            )?;
        }
        let value = result.lock(u64::from(self.id())).take();
        match value {
            Some(value) => Ok(value),
            None => unreachable!("synchronous unicast returned before the callback ran"),
        }
    }

    /// Invalidate `page_count` pages at `vaddr` on this core only.
    pub fn flush_tlb_local(&self, vaddr: VirtualAddress, page_count: usize) {
        for page in vaddr.pages::<Size4K>(page_count) {
            self.platform().invalidate_page(self.id(), page);
        }
    }

    /// Invalidate a range in `page_directory` wherever it may be cached.
    ///
    /// Kernel addresses, and user addresses of an address space that may be
    /// live on another core, are flushed everywhere; anything else only here.
    pub fn flush_tlb(&self, page_directory: PageDirectoryId, vaddr: VirtualAddress, page_count: usize) {
        let shared = !vaddr.is_user() || self.platform().may_be_active_elsewhere(page_directory);
        if self.processors.is_smp_enabled() && shared {
            self.smp_broadcast_flush_tlb(page_directory, vaddr, page_count);
        } else {
            self.flush_tlb_local(vaddr, page_count);
        }
    }

    /// Flush on every other core, then here. Returns once all are done.
    pub fn smp_broadcast_flush_tlb(
        &self,
        page_directory: PageDirectoryId,
        vaddr: VirtualAddress,
        page_count: usize,
    ) {
        let receivers = self.processors.count() - 1;
        if receivers > 0 && self.processors.is_smp_enabled() {
            let id = self.acquire_message();
            // Safety: freshly acquired, not yet published.
            unsafe {
                self.pool().prepare(
                    id,
                    Message::FlushTlb {
                        page_directory,
                        vaddr,
                        page_count,
                    },
                    receiver_count(receivers),
                    false,
                );
            };
            self.broadcast_message(id, false);
        }
        self.flush_tlb_local(vaddr, page_count);
    }

    /// Process everything queued for this core, oldest first.
    ///
    /// Returns whether anything was processed. Stops this core if a halt was
    /// requested.
    ///
    /// # Panics
    /// Before messaging is enabled.
    pub fn smp_process_pending_messages(&self) -> bool {
        assert!(
            self.processors.is_smp_enabled(),
            "CPU[{}]: message drain before SMP was enabled",
            self.id()
        );
        let _critical = self.critical();
        let pool = self.pool();

        let mut did_process = false;
        for id in pool.take_all(&self.processor.pending, self.id()) {
            did_process = true;

            // Safety: we are a receiver of `id` holding a reference.
            match unsafe { pool.payload(id) } {
                Some(Message::Callback(callback)) => callback(),
                Some(&Message::FlushTlb {
                    page_directory,
                    vaddr,
                    page_count,
                }) => self.handle_flush_tlb(page_directory, vaddr, page_count),
                None => panic!("SMP[{}]: message {id} delivered without payload", self.id()),
            }

            let is_async = pool.is_async(id);
            if pool.release_ref(id) == 1 && is_async {
                // Safety: we held the last reference.
                drop(unsafe { pool.take_payload(id) });
                pool.release(id);
            }

            if self.processor.is_halt_requested() {
                self.halt_this();
            }
        }

        if !did_process && self.processor.is_halt_requested() {
            self.halt_this();
        }
        did_process
    }

    fn handle_flush_tlb(&self, page_directory: PageDirectoryId, vaddr: VirtualAddress, page_count: usize) {
        let platform = self.platform();
        if vaddr.is_user() {
            let len = u64::try_from(page_count)
                .ok()
                .and_then(|n| n.checked_mul(Size4K::SIZE))
                .unwrap_or(u64::MAX);
            assert!(
                platform.is_user_range(vaddr, len),
                "SMP[{}]: user TLB flush spills out of user space at {vaddr}",
                self.id()
            );
            if platform.active_page_directory(self.id()) != page_directory {
                debug!(
                    "SMP[{}]: skip TLB flush of {vaddr} for inactive space {:?}",
                    self.id(),
                    page_directory.0
                );
                return;
            }
        }
        self.flush_tlb_local(vaddr, page_count);
    }

    /// Wake up to `wake_count` idle cores; returns how many were woken.
    ///
    /// Cores are claimed out of the idle set atomically, so concurrent callers
    /// never wake the same core twice. The number of claim rounds is bounded
    /// by the core count.
    ///
    /// # Panics
    /// If interrupts are enabled or `wake_count` is zero.
    pub fn smp_wake_n_idle_processors(&self, wake_count: u32) -> u32 {
        assert!(
            !self.interrupts_enabled(),
            "CPU[{}]: waking idle cores with interrupts enabled",
            self.id()
        );
        assert!(wake_count > 0, "CPU[{}]: asked to wake no cores", self.id());
        if !self.processors.is_smp_enabled() {
            return 0;
        }

        let others = receiver_count(self.processors.count() - 1);
        let wanted = wake_count.min(others);
        let self_bit = 1u64 << self.id();
        let idle = &self.processors.idle_mask;

        let mut woken = 0;
        for _ in 0..self.processors.count() {
            if woken >= wanted {
                break;
            }
            let candidates = idle.load(Ordering::Relaxed) & !self_bit;
            if candidates == 0 {
                break;
            }
            let want = lowest_bits(candidates, wanted - woken);
            let mut claimed = idle.fetch_and(!want, Ordering::AcqRel) & want;
            while claimed != 0 {
                let core = claimed.trailing_zeros();
                claimed &= claimed - 1;
                debug!("SMP[{}]: waking idle core {core}", self.id());
                self.platform().send_ipi(core);
                woken += 1;
            }
        }
        woken
    }

    /// Announce that this core is about to wait for work.
    pub fn enter_idle(&self) {
        self.processors
            .idle_mask
            .fetch_or(1 << self.id(), Ordering::Release);
    }

    /// Withdraw from the idle set, returning whether we were still in it.
    pub fn leave_idle(&self) -> bool {
        let bit = 1 << self.id();
        self.processors.idle_mask.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Flag every core, this one included, to stop and interrupt the others.
    pub fn smp_broadcast_halt(&self) {
        for p in self.processors.iter() {
            p.halt_requested.store(true, Ordering::Release);
        }
        self.platform().broadcast_ipi(self.id());
    }

    /// Stop the whole system from this core.
    pub fn halt(&self) -> ! {
        if self.processors.is_smp_enabled() {
            self.smp_broadcast_halt();
        }
        self.halt_this()
    }

    fn halt_this(&self) -> ! {
        debug!("CPU[{}]: halting", self.id());
        let _irq = InterruptDisabler::new(self.platform());
        Arch::halt_this(self.platform(), self.id())
    }
}

/// `count` is below [`MAX_CORES`](crate::MAX_CORES).
fn receiver_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// The `n` lowest set bits of `mask`.
const fn lowest_bits(mut mask: u64, n: u32) -> u64 {
    let mut picked = 0;
    let mut i = 0;
    while i < n && mask != 0 {
        let bit = mask & mask.wrapping_neg();
        picked |= bit;
        mask &= !bit;
        i += 1;
    }
    picked
}
