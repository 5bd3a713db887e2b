use kernel_percpu::testing::{SimPlatform, modern_cpu, with_interrupts_disabled};
use kernel_percpu::{
    CpuidResult, PreviousMode, Processors, RegisterState, SchedulingTimes, Thread, TrapSource,
};

fn single_core() -> Processors<SimPlatform> {
    let processors = Processors::new(SimPlatform::new(1), 1);
    processors.core(0).early_initialize();
    processors
}

fn leak(id: u64) -> &'static Thread {
    Box::leak(Box::new(Thread::new(id)))
}

#[test]
fn user_and_kernel_time_are_charged_across_a_syscall() {
    let processors = single_core();
    let platform = processors.platform();
    let core = processors.core(0);
    let thread = leak(1);
    core.set_current_thread(thread);
    thread.update_time_scheduled(0, true, false);

    platform.advance_clock(10);
    with_interrupts_disabled(|| {
        let envelope = core.enter_trap(&RegisterState::user(), TrapSource::Syscall);
        assert_eq!(thread.previous_mode(), PreviousMode::User);
        assert_eq!(thread.trap_depth(), 1);
        assert_eq!(core.in_irq(), 0);

        platform.advance_clock(4);
        core.exit_trap(envelope);
    });

    assert_eq!(thread.previous_mode(), PreviousMode::Kernel);
    assert_eq!(thread.trap_depth(), 0);
    assert_eq!(thread.time_scheduled(), SchedulingTimes { user: 10, kernel: 4 });
}

#[test]
fn nested_traps_restore_the_enclosing_mode() {
    let processors = single_core();
    let core = processors.core(0);
    let thread = leak(2);
    core.set_current_thread(thread);

    with_interrupts_disabled(|| {
        let outer = core.enter_trap(&RegisterState::user(), TrapSource::Exception);
        let inner = core.enter_trap(&RegisterState::kernel(), TrapSource::Irq);
        assert_eq!(thread.previous_mode(), PreviousMode::Kernel);
        assert_eq!(thread.trap_depth(), 2);
        assert_eq!(core.in_irq(), 1);
        assert_eq!(inner.prev_irq_level(), 0);

        core.exit_trap(inner);
        assert_eq!(thread.previous_mode(), PreviousMode::User);
        assert_eq!(core.in_irq(), 0);

        core.exit_trap(outer);
        assert_eq!(thread.previous_mode(), PreviousMode::Kernel);
    });
}

#[test]
fn nested_interrupts_do_not_charge_time() {
    let processors = single_core();
    let platform = processors.platform();
    let core = processors.core(0);
    let thread = leak(3);
    core.set_current_thread(thread);
    thread.update_time_scheduled(0, true, false);

    with_interrupts_disabled(|| {
        let outer = core.enter_trap(&RegisterState::kernel(), TrapSource::Irq);
        platform.advance_clock(5);
        // mode changes but an interrupt is already active
        let inner = core.enter_trap(&RegisterState::user(), TrapSource::Irq);
        assert_eq!(thread.time_scheduled(), SchedulingTimes::default());
        core.exit_trap(inner);
        core.exit_trap(outer);
    });
    // only the return to the enclosing kernel trap charged anything
    assert_eq!(thread.time_scheduled().user, 0);
    assert_eq!(thread.time_scheduled().kernel, 5);
}

#[test]
fn scheduler_runs_once_when_the_outermost_trap_unwinds() {
    let processors = single_core();
    let core = processors.core(0);
    core.set_scheduler_initialized();

    with_interrupts_disabled(|| {
        core.handle_interrupt(&RegisterState::kernel(), |core| {
            core.invoke_scheduler_async();
            core.handle_interrupt(&RegisterState::kernel(), |core| {
                core.invoke_scheduler_async();
            });
            assert_eq!(processors.platform().scheduler_invocations(0), 0);
        });
    });
    assert_eq!(processors.platform().scheduler_invocations(0), 1);
    assert!(!core.is_scheduler_invoke_pending());
}

#[test]
fn scheduler_waits_for_an_enclosing_critical_section() {
    let processors = single_core();
    let core = processors.core(0);
    core.set_scheduler_initialized();

    core.enter_critical();
    with_interrupts_disabled(|| {
        core.handle_interrupt(&RegisterState::kernel(), |core| core.invoke_scheduler_async());
    });
    assert_eq!(processors.platform().scheduler_invocations(0), 0);
    core.leave_critical();
    assert_eq!(processors.platform().scheduler_invocations(0), 1);
}

#[test]
#[should_panic(expected = "trap entered with interrupts enabled")]
fn entering_a_trap_with_interrupts_enabled_is_fatal() {
    let processors = single_core();
    let _ = processors
        .core(0)
        .enter_trap(&RegisterState::kernel(), TrapSource::Irq);
}

#[test]
#[should_panic(expected = "below trap entry level")]
fn unwinding_below_the_recorded_interrupt_level_is_fatal() {
    let processors = single_core();
    let core = processors.core(0);
    with_interrupts_disabled(|| {
        let outer = core.enter_trap(&RegisterState::kernel(), TrapSource::Irq);
        let inner = core.enter_trap(&RegisterState::kernel(), TrapSource::Irq);
        core.exit_trap(outer);
        core.exit_trap(inner);
    });
}

#[test]
#[should_panic(expected = "innermost first")]
fn traps_must_unwind_in_order() {
    let processors = single_core();
    let core = processors.core(0);
    core.set_current_thread(leak(4));
    with_interrupts_disabled(|| {
        let outer = core.enter_trap(&RegisterState::user(), TrapSource::Exception);
        let inner = core.enter_trap(&RegisterState::kernel(), TrapSource::Exception);
        core.exit_trap(outer);
        core.exit_trap(inner);
    });
}

#[test]
fn context_switch_carries_critical_depth() {
    let processors = single_core();
    let core = processors.core(0);
    let (a, b) = (leak(10), leak(11));
    core.set_current_thread(a);
    core.enter_critical();
    core.enter_critical();

    with_interrupts_disabled(|| {
        // Safety: the simulated switch only records the request.
        unsafe { core.switch_context(a, b) };
    });
    assert_eq!(a.saved_critical(), 2);
    assert_eq!(core.current_thread().map(Thread::id), Some(11));
    assert_eq!(core.in_critical(), 1);
    assert_eq!(processors.platform().switches(), [(0, 10, 11)]);
}

#[test]
#[should_panic(expected = "resumed outside a critical section")]
fn resuming_a_thread_saved_at_depth_zero_is_fatal() {
    let processors = single_core();
    let core = processors.core(0);
    let (a, b) = (leak(12), leak(13));
    b.save_critical(0);
    core.set_current_thread(a);
    with_interrupts_disabled(|| unsafe { core.switch_context(a, b) });
}

#[test]
fn first_switch_enters_the_new_thread() {
    let processors = single_core();
    let core = processors.core(0);
    let (idle, first) = (leak(20), leak(21));
    core.set_current_thread(first);

    with_interrupts_disabled(|| core.first_switch(idle, first));
    assert_eq!(processors.platform().entered_threads(), [(0, 20, true)]);
    assert_eq!(core.in_critical(), 1);
}

#[test]
fn early_initialize_records_features_and_loads_descriptors() {
    let processors = Processors::new(SimPlatform::new(2), 2);
    for id in 0..2 {
        let core = processors.core(id);
        core.early_initialize();
        core.initialize();
    }
    let p = &processors[1];
    assert!(p.features().sse() && p.features().fxsr() && p.features().hypervisor());
    assert!(p.features().nx() && p.features().smap());
    assert_eq!(p.physical_address_bits(), 40);
    assert_eq!(processors.platform().descriptor_tables_installed(), 2);
    let enabled = processors.platform().enabled_extensions();
    assert_eq!(enabled.len(), 2);
    assert_eq!(enabled[0].1, p.features());
}

#[test]
fn boot_core_under_hyperv_initializes() {
    fn hyperv(leaf: u32, subleaf: u32) -> CpuidResult {
        match leaf {
            0x4000_0000 => CpuidResult {
                eax: 0x4000_0005,
                ebx: u32::from_le_bytes(*b"Micr"),
                ecx: u32::from_le_bytes(*b"osof"),
                edx: u32::from_le_bytes(*b"t Hv"),
            },
            0x4000_0001 => CpuidResult {
                eax: u32::from_le_bytes(*b"Hv#1"),
                ..CpuidResult::default()
            },
            _ => modern_cpu(leaf, subleaf),
        }
    }
    let processors = Processors::new(SimPlatform::new(1).with_cpuid(hyperv), 1);
    let core = processors.core(0);
    core.early_initialize();
    core.initialize();
    assert!(processors[0].features().hypervisor());
}

#[test]
#[should_panic(expected = "SSE without FXSR")]
fn sse_without_fxsr_is_fatal() {
    fn broken(leaf: u32, _: u32) -> CpuidResult {
        match leaf {
            1 => CpuidResult {
                edx: 1 << 25,
                ..CpuidResult::default()
            },
            _ => CpuidResult::default(),
        }
    }
    let processors = Processors::new(SimPlatform::new(1).with_cpuid(broken), 1);
    processors.core(0).early_initialize();
}
