//! # Trap envelope
//!
//! Every interrupt, exception and system call is bracketed by
//! [`Core::enter_trap`] and [`Core::exit_trap`]. Entry records the mode the
//! thread trapped from and charges elapsed time to it; exit drains messages
//! and deferred calls, restores the mode of the enclosing trap and, once the
//! core is back at depth zero, runs a latched scheduler request.

use crate::platform::{Platform, Scheduler};
use crate::thread::{PreviousMode, Thread};
use crate::Core;
use bitfield_struct::bitfield;
use core::sync::atomic::Ordering;

/// RFLAGS as saved in a trap frame.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    pub cf_carry: bool, // 0
    #[bits(default = true)]
    _always1: bool, // 1
    pub pf_parity: bool, // 2
    _rsvd3: bool,
    pub af_adjust: bool, // 4
    _rsvd5: bool,
    pub zf_zero: bool,            // 6
    pub sf_sign: bool,            // 7
    pub tf_trap: bool,            // 8
    pub if_interrupt_enable: bool, // 9
    pub df_direction: bool,       // 10
    pub of_overflow: bool,        // 11
    #[bits(2)]
    pub iopl: u8, // 12-13
    pub nt_nested: bool, // 14
    _rsvd15: bool,
    pub rf_resume: bool, // 16
    _vm: bool,
    pub ac_alignment_check: bool, // 18
    #[bits(45)]
    _rsvd_hi: u64,
}

/// General-purpose registers and the hardware frame, as pushed by the entry stubs.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterState {
    /// A frame that trapped from ring 0.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::with_selectors(crate::KERNEL_CS.0, crate::KERNEL_DS.0)
    }

    /// A frame that trapped from ring 3.
    #[must_use]
    pub const fn user() -> Self {
        Self::with_selectors(crate::USER_CS.0, crate::USER_DS.0)
    }

    const fn with_selectors(cs: u16, ss: u16) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            cs: cs as u64,
            rflags: Rflags::new().with_if_interrupt_enable(true).into_bits(),
            rsp: 0,
            ss: ss as u64,
        }
    }

    /// Privilege level the trapped code ran at, from the saved `cs`.
    #[must_use]
    pub const fn previous_mode(&self) -> PreviousMode {
        if self.cs & 0b11 == 0 {
            PreviousMode::Kernel
        } else {
            PreviousMode::User
        }
    }

    #[must_use]
    pub const fn flags(&self) -> Rflags {
        Rflags::from_bits(self.rflags)
    }

    /// Function number and the four argument registers of a system call.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn capture_syscall_params(&self) -> (usize, [usize; 4]) {
        (
            self.rax as usize,
            [
                self.rdi as usize,
                self.rsi as usize,
                self.rdx as usize,
                self.r10 as usize,
            ],
        )
    }

    pub const fn set_return_reg(&mut self, value: usize) {
        self.rax = value as u64;
    }
}

/// What caused the trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapSource {
    /// Hardware interrupt; raises the core's interrupt depth.
    Irq,
    Exception,
    Syscall,
}

/// Handed out by [`Core::enter_trap`], must be returned to [`Core::exit_trap`].
#[derive(Debug)]
#[must_use = "every trap entered must be exited"]
pub struct TrapEnvelope {
    prev_irq_level: u32,
    /// Position on the current thread's trap stack, if there was a thread.
    slot: Option<usize>,
    source: TrapSource,
}

impl TrapEnvelope {
    #[must_use]
    pub const fn source(&self) -> TrapSource {
        self.source
    }

    #[must_use]
    pub const fn prev_irq_level(&self) -> u32 {
        self.prev_irq_level
    }
}

impl<P: Platform> Core<'_, P> {
    /// # Panics
    /// If interrupts are enabled.
    pub fn enter_trap(&self, regs: &RegisterState, source: TrapSource) -> TrapEnvelope {
        assert!(
            !self.interrupts_enabled(),
            "CPU[{}]: trap entered with interrupts enabled",
            self.id()
        );
        let prev_irq_level = self.in_irq();
        if source == TrapSource::Irq {
            self.processor
                .in_irq
                .store(prev_irq_level + 1, Ordering::Relaxed);
        }

        let slot = self.current_thread().map(|thread| {
            let mode = regs.previous_mode();
            let slot = thread.push_trap(mode);
            if thread.set_previous_mode(mode) && prev_irq_level == 0 {
                let now = Scheduler::current_time(self.platform());
                thread.update_time_scheduled(now, mode == PreviousMode::Kernel, false);
            }
            slot
        });

        TrapEnvelope {
            prev_irq_level,
            slot,
            source,
        }
    }

    /// # Panics
    /// If interrupts are enabled, if the interrupt depth is below the one the
    /// envelope recorded, or if traps are exited out of order.
    pub fn exit_trap(&self, envelope: TrapEnvelope) {
        assert!(
            !self.interrupts_enabled(),
            "CPU[{}]: trap exited with interrupts enabled",
            self.id()
        );
        self.enter_critical();

        let in_irq = self.in_irq();
        assert!(
            in_irq >= envelope.prev_irq_level,
            "CPU[{}]: interrupt depth {in_irq} below trap entry level {}",
            self.id(),
            envelope.prev_irq_level
        );
        self.processor
            .in_irq
            .store(envelope.prev_irq_level, Ordering::Relaxed);

        if self.processors.is_smp_enabled() {
            self.smp_process_pending_messages();
        }
        self.deferred_call_execute_pending();

        if let Some(thread) = self.current_thread() {
            self.restore_previous_mode(thread, envelope.slot);
        }

        let depth = self.in_critical();
        self.processor
            .in_critical
            .store(depth - 1, Ordering::Relaxed);
        if !self.is_in_critical_or_irq() {
            self.check_invoke_scheduler();
        }
    }

    fn restore_previous_mode(&self, thread: &'static Thread, slot: Option<usize>) {
        let enclosing = match slot {
            Some(slot) => thread.pop_trap(slot),
            None => thread.innermost_trap_mode(),
        };
        let mode = enclosing.unwrap_or(PreviousMode::Kernel);
        if thread.set_previous_mode(mode) {
            let now = Scheduler::current_time(self.platform());
            thread.update_time_scheduled(now, true, false);
        }
    }

    /// Enter and exit an interrupt trap around `handler`.
    ///
    /// # Panics
    /// As for [`enter_trap`](Self::enter_trap).
    pub fn handle_interrupt(&self, regs: &RegisterState, handler: impl FnOnce(&Self)) {
        let envelope = self.enter_trap(regs, TrapSource::Irq);
        handler(self);
        self.exit_trap(envelope);
    }
}
