//! The system call table.
//!
//! Built once during boot and read-only afterwards. Each entry pairs a
//! handler with the lock flag of its call number; a slot nobody registered
//! dispatches as `ENOSYS`.

use crate::abi::{HandlerKind, NeedsBigLock, Sysno};
use crate::errno::Errno;
use core::fmt;
use kernel_percpu::{RegisterState, Thread};
use kernel_sync::SpinLock;

/// What dispatch needs to know about the calling process.
pub trait Process: Sync {
    /// Taken around calls marked [`NeedsBigLock::Yes`], owned by the calling thread.
    fn big_lock(&self) -> &SpinLock<()>;

    /// The process is being torn down; its threads must not run system calls.
    fn is_dying(&self) -> bool;

    /// Returns whether a tracer asked to stop at the next system call
    /// boundary, clearing the request.
    fn take_syscall_trace_request(&self) -> bool;

    /// Stop `thread` for the tracer, which may inspect and modify `regs`.
    fn tracer_trap(&self, thread: &Thread, regs: &mut RegisterState);

    /// Runs after the result is in place: stopped threads yield, pending
    /// signals are dispatched.
    fn after_syscall(&self, thread: &Thread);
}

pub type ArgsHandler<P> = fn(&P, &Thread, [usize; 4]) -> Result<usize, Errno>;
pub type RegistersHandler<P> = fn(&P, &Thread, &mut RegisterState) -> Result<usize, Errno>;
pub type NoReturnHandler<P> = fn(&P, &Thread, [usize; 4]) -> !;

pub enum Handler<P> {
    Args(ArgsHandler<P>),
    Registers(RegistersHandler<P>),
    NoReturn(NoReturnHandler<P>),
}

impl<P> Handler<P> {
    #[must_use]
    pub const fn kind(&self) -> HandlerKind {
        match self {
            Self::Args(_) => HandlerKind::Args,
            Self::Registers(_) => HandlerKind::Registers,
            Self::NoReturn(_) => HandlerKind::NoReturn,
        }
    }
}

impl<P> Clone for Handler<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Handler<P> {}

impl<P> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

pub struct Descriptor<P> {
    pub handler: Handler<P>,
    pub needs_big_lock: NeedsBigLock,
}

impl<P> Clone for Descriptor<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Descriptor<P> {}

impl<P> fmt::Debug for Descriptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("handler", &self.handler)
            .field("needs_big_lock", &self.needs_big_lock)
            .finish()
    }
}

pub struct SyscallTable<P> {
    entries: [Option<Descriptor<P>>; Sysno::COUNT],
}

impl<P> SyscallTable<P> {
    /// A table where every call is `ENOSYS`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [const { None }; Sysno::COUNT],
        }
    }

    /// Install the handler for `sysno`.
    ///
    /// # Panics
    /// If the handler's shape does not match how `sysno` is called, or if
    /// `sysno` already has a handler.
    pub fn register(&mut self, sysno: Sysno, handler: Handler<P>) -> &mut Self {
        assert_eq!(
            handler.kind(),
            sysno.kind(),
            "sys${} registered with the wrong handler shape",
            sysno.name()
        );
        let entry = &mut self.entries[sysno.number()];
        assert!(entry.is_none(), "sys${} registered twice", sysno.name());
        *entry = Some(Descriptor {
            handler,
            needs_big_lock: sysno.needs_big_lock(),
        });
        self
    }

    /// Builder form of [`register`](Self::register).
    ///
    /// # Panics
    /// As for [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, sysno: Sysno, handler: Handler<P>) -> Self {
        self.register(sysno, handler);
        self
    }

    /// The entry for a raw call number.
    ///
    /// `Ok(None)` for an unregistered slot.
    ///
    /// # Errors
    /// `ENOSYS` if the number is out of range.
    pub fn lookup(&self, function: usize) -> Result<Option<&Descriptor<P>>, Errno> {
        self.entries
            .get(function)
            .map(Option::as_ref)
            .ok_or(Errno::ENOSYS)
    }

    #[must_use]
    pub fn is_registered(&self, sysno: Sysno) -> bool {
        self.entries[sysno.number()].is_some()
    }
}

impl<P> Default for SyscallTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    fn getpid(_: &Nothing, _: &Thread, _: [usize; 4]) -> Result<usize, Errno> {
        Ok(1)
    }

    fn fork(_: &Nothing, _: &Thread, _: &mut RegisterState) -> Result<usize, Errno> {
        Ok(2)
    }

    #[test]
    fn registered_entries_carry_the_lock_flag() {
        let table = SyscallTable::new()
            .with(Sysno::Getpid, Handler::Args(getpid))
            .with(Sysno::Fork, Handler::Registers(fork));
        let getpid = table.lookup(Sysno::Getpid.number()).unwrap().unwrap();
        assert_eq!(getpid.needs_big_lock, NeedsBigLock::No);
        let fork = table.lookup(Sysno::Fork.number()).unwrap().unwrap();
        assert_eq!(fork.needs_big_lock, NeedsBigLock::Yes);
        assert!(table.lookup(Sysno::Read.number()).unwrap().is_none());
        assert_eq!(table.lookup(Sysno::COUNT).unwrap_err(), Errno::ENOSYS);
    }

    #[test]
    #[should_panic(expected = "wrong handler shape")]
    fn fork_needs_the_register_state() {
        let _ = SyscallTable::new().with(Sysno::Fork, Handler::Args(getpid));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_is_fatal() {
        let _ = SyscallTable::new()
            .with(Sysno::Getpid, Handler::Args(getpid))
            .with(Sysno::Getpid, Handler::Args(getpid));
    }
}
