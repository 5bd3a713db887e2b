//! System call entry and routing.

use crate::abi::NeedsBigLock;
use crate::errno::{Errno, encode_result};
use crate::table::{Handler, Process, SyscallTable};
use kernel_percpu::{Arch, Core, Platform, PreviousMode, RegisterState, Thread, TrapSource};
use log::{trace, warn};

/// Route call `function` to its handler.
///
/// Takes the process-wide lock for the duration of the call when the entry
/// asks for it. `exit` and `exit_thread` do not come back.
///
/// # Errors
/// `ENOSYS` for an out-of-range number or an empty slot, otherwise whatever
/// the handler returns.
pub fn handle<P: Process>(
    table: &SyscallTable<P>,
    process: &P,
    thread: &Thread,
    regs: &mut RegisterState,
    function: usize,
    args: [usize; 4],
) -> Result<usize, Errno> {
    thread.did_syscall();

    let descriptor = match table.lookup(function) {
        Ok(Some(descriptor)) => *descriptor,
        Ok(None) => {
            warn!("Null syscall {function} requested, you probably need to rebuild this program!");
            return Err(Errno::ENOSYS);
        }
        Err(errno) => {
            let [a1, a2, a3, a4] = args;
            warn!("Unknown syscall {function} requested ({a1:#x}, {a2:#x}, {a3:#x}, {a4:#x})");
            return Err(errno);
        }
    };

    let _big_lock = (descriptor.needs_big_lock == NeedsBigLock::Yes)
        .then(|| process.big_lock().lock(thread.id()));

    match descriptor.handler {
        Handler::NoReturn(handler) => {
            // The tracer sees the call before the thread goes away.
            if process.take_syscall_trace_request() {
                regs.set_return_reg(0);
                process.tracer_trap(thread, regs);
            }
            handler(process, thread, args)
        }
        Handler::Registers(handler) => handler(process, thread, regs),
        Handler::Args(handler) => handler(process, thread, args),
    }
}

/// Run the system call the current thread trapped with and store its result.
///
/// # Panics
/// - without a current thread;
/// - if the caller runs with IOPL != 0 or did not trap from user mode;
/// - if the process-wide lock is still held once the call is done.
pub fn handle_syscall_trap<A: Platform, P: Process>(
    core: &Core<'_, A>,
    table: &SyscallTable<P>,
    process: &P,
    regs: &mut RegisterState,
) {
    let Some(thread) = core.current_thread() else {
        panic!("CPU[{}]: system call without a current thread", core.id());
    };
    assert_eq!(
        regs.flags().iopl(),
        0,
        "CPU[{}]: syscall from process with IOPL != 0",
        core.id()
    );
    assert_eq!(
        thread.previous_mode(),
        PreviousMode::User,
        "CPU[{}]: syscall trap from kernel mode",
        core.id()
    );
    if process.is_dying() {
        trace!("CPU[{}]: thread {} of a dying process", core.id(), thread.id());
        return;
    }

    if process.take_syscall_trace_request() {
        process.tracer_trap(thread, regs);
    }

    let (function, args) = regs.capture_syscall_params();
    let result = handle(table, process, thread, regs, function, args);
    regs.set_return_reg(encode_result(result));

    if process.take_syscall_trace_request() {
        process.tracer_trap(thread, regs);
    }
    process.after_syscall(thread);

    assert_eq!(
        thread.previous_mode(),
        PreviousMode::User,
        "CPU[{}]: syscall returns to kernel mode",
        core.id()
    );
    assert!(
        !process.big_lock().is_owned_by(thread.id()),
        "CPU[{}]: thread {} returned from a syscall holding the big lock",
        core.id(),
        thread.id()
    );
}

/// The body of the [`SYSCALL_VECTOR`](crate::SYSCALL_VECTOR) handler.
///
/// Brackets the call in a trap envelope and runs it with interrupts enabled.
///
/// # Panics
/// As for [`Core::enter_trap`] and [`handle_syscall_trap`].
pub fn syscall_entry<A: Platform, P: Process>(
    core: &Core<'_, A>,
    table: &SyscallTable<P>,
    process: &P,
    regs: &mut RegisterState,
) {
    let envelope = core.enter_trap(regs, TrapSource::Syscall);
    Arch::enable_interrupts(core.platform());
    handle_syscall_trap(core, table, process, regs);
    Arch::disable_interrupts(core.platform());
    core.exit_trap(envelope);
}
