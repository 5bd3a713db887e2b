//! Critical sections and the deferred scheduler request.
//!
//! While a core's critical depth is non-zero the scheduler must not switch
//! threads on it. Requests to reschedule that arrive meanwhile are latched in
//! `invoke_scheduler_async` and honored once the core is back at depth zero
//! outside interrupt context.

use crate::Core;
use crate::platform::{Arch, InterruptDisabler, Platform, Scheduler};
use core::sync::atomic::Ordering;

impl<'a, P: Platform> Core<'a, P> {
    #[must_use]
    pub fn in_critical(&self) -> u32 {
        self.processor.in_critical.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn in_irq(&self) -> u32 {
        self.processor.in_irq.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_in_critical_or_irq(&self) -> bool {
        self.in_critical() > 0 || self.in_irq() > 0
    }

    pub fn enter_critical(&self) {
        let depth = self.in_critical();
        self.processor.in_critical.store(depth + 1, Ordering::Relaxed);
    }

    /// Leave one level. Leaving the outermost level outside interrupt context
    /// runs pending deferred calls first and then honors a latched scheduler
    /// request.
    ///
    /// # Panics
    /// If the core is not in a critical section.
    pub fn leave_critical(&self) {
        let _irq = InterruptDisabler::new(self.platform());
        let depth = self.in_critical();
        assert!(
            depth > 0,
            "CPU[{}]: leave_critical without a matching enter_critical",
            self.id()
        );

        if depth > 1 {
            self.processor.in_critical.store(depth - 1, Ordering::Relaxed);
            return;
        }

        if self.in_irq() == 0 {
            self.deferred_call_execute_pending();
            debug_assert_eq!(self.in_critical(), 1);
        }
        self.processor.in_critical.store(0, Ordering::Relaxed);
        if self.in_irq() == 0 {
            self.check_invoke_scheduler();
        }
    }

    /// Enter a critical section for the lifetime of the returned guard.
    pub fn critical(&self) -> ScopedCritical<'a, P> {
        self.enter_critical();
        ScopedCritical { core: *self }
    }

    /// Drop to depth zero and return the depth that was active.
    pub fn clear_critical(&self) -> u32 {
        let _irq = InterruptDisabler::new(self.platform());
        let previous = self.in_critical();
        self.processor.in_critical.store(0, Ordering::Relaxed);
        if self.in_irq() == 0 {
            self.check_invoke_scheduler();
        }
        previous
    }

    /// Re-establish a depth saved by [`clear_critical`](Self::clear_critical)
    /// or at a context switch.
    pub fn restore_critical(&self, depth: u32) {
        self.processor.in_critical.store(depth, Ordering::Relaxed);
    }

    /// Latch a request to run the scheduler at the next safe point.
    pub fn invoke_scheduler_async(&self) {
        self.processor
            .invoke_scheduler_async
            .store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_scheduler_invoke_pending(&self) -> bool {
        self.processor.invoke_scheduler_async.load(Ordering::Relaxed)
    }

    /// Marks the scheduler as ready to take requests on this core.
    pub fn set_scheduler_initialized(&self) {
        self.processor
            .scheduler_initialized
            .store(true, Ordering::Relaxed);
    }

    /// Hand a latched scheduler request to the scheduler, once.
    ///
    /// # Panics
    /// If called inside a critical section or interrupt handler.
    pub fn check_invoke_scheduler(&self) {
        let _irq = InterruptDisabler::new(self.platform());
        assert!(
            !self.is_in_critical_or_irq(),
            "CPU[{}]: scheduler checked inside critical section or interrupt",
            self.id()
        );
        if !self.processor.scheduler_initialized.load(Ordering::Relaxed) {
            return;
        }
        if self
            .processor
            .invoke_scheduler_async
            .swap(false, Ordering::Relaxed)
        {
            Scheduler::invoke_async(self.platform(), self.id());
        }
    }

    pub(crate) fn interrupts_enabled(&self) -> bool {
        Arch::interrupts_enabled(self.platform())
    }
}

/// Guard returned by [`Core::critical`]; leaves on drop.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct ScopedCritical<'a, P: Platform> {
    core: Core<'a, P>,
}

impl<P: Platform> Drop for ScopedCritical<'_, P> {
    fn drop(&mut self) {
        self.core.leave_critical();
    }
}
