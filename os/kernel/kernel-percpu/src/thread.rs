//! The slice of thread state the per-core code reads and writes.
//!
//! Threads are owned by the scheduler and outlive every core that runs them,
//! so the core holds `&'static Thread`. All fields are written only by the
//! core currently running the thread (with interrupts disabled), which is why
//! relaxed atomics suffice; the scheduler's own lock orders hand-offs between
//! cores.

use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub type ThreadId = u64;

/// Privilege the thread was executing at before the current trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PreviousMode {
    Kernel = 0,
    User = 1,
}

impl PreviousMode {
    const fn from_u8(v: u8) -> Self {
        if v == Self::User as u8 {
            Self::User
        } else {
            Self::Kernel
        }
    }
}

/// Deepest supported nesting of traps on one thread.
pub const MAX_TRAP_DEPTH: usize = 16;

const NOT_SCHEDULED: u64 = u64::MAX;

/// Accumulated ticks per privilege level.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SchedulingTimes {
    pub user: u64,
    pub kernel: u64,
}

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    previous_mode: AtomicU8,
    /// Mode recorded by each active trap, innermost last.
    trap_modes: [AtomicU8; MAX_TRAP_DEPTH],
    trap_depth: AtomicUsize,
    /// Critical depth saved while switched out.
    saved_critical: AtomicU32,
    last_time_scheduled: AtomicU64,
    time_in_user: AtomicU64,
    time_in_kernel: AtomicU64,
    syscall_count: AtomicU64,
}

impl Thread {
    /// A thread that starts out in kernel mode, one critical level deep, as
    /// a freshly created thread does when it is entered for the first time.
    #[must_use]
    pub const fn new(id: ThreadId) -> Self {
        Self {
            id,
            previous_mode: AtomicU8::new(PreviousMode::Kernel as u8),
            trap_modes: [const { AtomicU8::new(0) }; MAX_TRAP_DEPTH],
            trap_depth: AtomicUsize::new(0),
            saved_critical: AtomicU32::new(1),
            last_time_scheduled: AtomicU64::new(NOT_SCHEDULED),
            time_in_user: AtomicU64::new(0),
            time_in_kernel: AtomicU64::new(0),
            syscall_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn previous_mode(&self) -> PreviousMode {
        PreviousMode::from_u8(self.previous_mode.load(Ordering::Relaxed))
    }

    /// Returns whether the mode changed.
    pub fn set_previous_mode(&self, mode: PreviousMode) -> bool {
        self.previous_mode.swap(mode as u8, Ordering::Relaxed) != mode as u8
    }

    /// Number of traps currently active on this thread.
    #[must_use]
    pub fn trap_depth(&self) -> usize {
        self.trap_depth.load(Ordering::Relaxed)
    }

    /// Record a trap taken from `mode`; returns the slot it occupies.
    ///
    /// # Panics
    /// If traps nest deeper than [`MAX_TRAP_DEPTH`].
    pub(crate) fn push_trap(&self, mode: PreviousMode) -> usize {
        let depth = self.trap_depth.load(Ordering::Relaxed);
        assert!(
            depth < MAX_TRAP_DEPTH,
            "thread {}: trap nesting exceeds {MAX_TRAP_DEPTH}",
            self.id
        );
        self.trap_modes[depth].store(mode as u8, Ordering::Relaxed);
        self.trap_depth.store(depth + 1, Ordering::Relaxed);
        depth
    }

    /// Unwind the trap in `slot`, which must be the innermost one.
    ///
    /// Returns the mode recorded by the trap that is now innermost, if any.
    ///
    /// # Panics
    /// If `slot` is not the innermost trap.
    pub(crate) fn pop_trap(&self, slot: usize) -> Option<PreviousMode> {
        let depth = self.trap_depth.load(Ordering::Relaxed);
        assert_eq!(
            depth,
            slot + 1,
            "thread {}: traps must be unwound innermost first",
            self.id
        );
        self.trap_depth.store(slot, Ordering::Relaxed);
        self.innermost_trap_mode()
    }

    pub(crate) fn innermost_trap_mode(&self) -> Option<PreviousMode> {
        let depth = self.trap_depth.load(Ordering::Relaxed);
        let slot = depth.checked_sub(1)?;
        Some(PreviousMode::from_u8(
            self.trap_modes[slot].load(Ordering::Relaxed),
        ))
    }

    /// Charge the time since the last update to kernel time if `is_kernel`,
    /// else to user time.
    ///
    /// A clock that reads lower than the last update is charged by the
    /// absolute difference.
    ///
    /// With `no_longer_running` the thread stops accruing time until the
    /// next update.
    pub fn update_time_scheduled(&self, now: u64, is_kernel: bool, no_longer_running: bool) {
        let last = self.last_time_scheduled.load(Ordering::Relaxed);
        if last != NOT_SCHEDULED {
            let delta = now.abs_diff(last);
            let bucket = if is_kernel {
                &self.time_in_kernel
            } else {
                &self.time_in_user
            };
            bucket.fetch_add(delta, Ordering::Relaxed);
        }
        let next = if no_longer_running { NOT_SCHEDULED } else { now };
        self.last_time_scheduled.store(next, Ordering::Relaxed);
    }

    #[must_use]
    pub fn time_scheduled(&self) -> SchedulingTimes {
        SchedulingTimes {
            user: self.time_in_user.load(Ordering::Relaxed),
            kernel: self.time_in_kernel.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn saved_critical(&self) -> u32 {
        self.saved_critical.load(Ordering::Relaxed)
    }

    pub fn save_critical(&self, depth: u32) {
        self.saved_critical.store(depth, Ordering::Relaxed);
    }

    pub fn did_syscall(&self) {
        self.syscall_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn syscall_count(&self) -> u64 {
        self.syscall_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traps_unwind_innermost_first() {
        let t = Thread::new(1);
        let outer = t.push_trap(PreviousMode::User);
        let inner = t.push_trap(PreviousMode::Kernel);
        assert_eq!(t.trap_depth(), 2);
        assert_eq!(t.pop_trap(inner), Some(PreviousMode::User));
        assert_eq!(t.pop_trap(outer), None);
        assert_eq!(t.trap_depth(), 0);
    }

    #[test]
    #[should_panic(expected = "innermost first")]
    fn unwinding_an_outer_trap_first_is_fatal() {
        let t = Thread::new(1);
        let outer = t.push_trap(PreviousMode::User);
        let _inner = t.push_trap(PreviousMode::Kernel);
        t.pop_trap(outer);
    }

    #[test]
    #[should_panic(expected = "trap nesting exceeds")]
    fn trap_stack_is_bounded() {
        let t = Thread::new(1);
        for _ in 0..=MAX_TRAP_DEPTH {
            t.push_trap(PreviousMode::Kernel);
        }
    }

    #[test]
    fn time_is_charged_to_the_requested_bucket() {
        let t = Thread::new(1);
        // first update only starts the clock
        t.update_time_scheduled(100, false, false);
        assert_eq!(t.time_scheduled(), SchedulingTimes::default());

        // trap taken after 30 ticks in user mode
        t.update_time_scheduled(130, false, false);
        // trap returns after 5 ticks in the kernel
        t.update_time_scheduled(135, true, false);
        assert_eq!(t.time_scheduled(), SchedulingTimes { user: 30, kernel: 5 });

        // switched out: the gap until the next update is not charged
        t.update_time_scheduled(140, false, true);
        t.update_time_scheduled(1000, true, false);
        assert_eq!(t.time_scheduled(), SchedulingTimes { user: 35, kernel: 5 });
    }

    #[test]
    fn wrapped_clock_charges_the_absolute_difference() {
        let t = Thread::new(1);
        t.update_time_scheduled(100, false, false);
        t.update_time_scheduled(40, true, false);
        assert_eq!(t.time_scheduled(), SchedulingTimes { user: 0, kernel: 60 });

        t.update_time_scheduled(55, false, false);
        assert_eq!(t.time_scheduled(), SchedulingTimes { user: 15, kernel: 60 });
    }

    #[test]
    fn previous_mode_reports_changes() {
        let t = Thread::new(7);
        assert_eq!(t.previous_mode(), PreviousMode::Kernel);
        assert!(t.set_previous_mode(PreviousMode::User));
        assert!(!t.set_previous_mode(PreviousMode::User));
        assert_eq!(t.previous_mode(), PreviousMode::User);
    }
}
