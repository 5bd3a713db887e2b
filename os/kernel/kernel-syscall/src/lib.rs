//! # System call dispatch
//!
//! Call numbers and error codes shared with user space ([`abi`], [`Errno`]),
//! the boot-time [`SyscallTable`], the entry path run from the
//! [`SYSCALL_VECTOR`] handler ([`syscall_entry`]) and the primitives handlers
//! use to reach user memory ([`user_copy`]).
//!
//! ```rust
//! # use kernel_syscall::{Errno, Handler, Sysno, SyscallTable};
//! # use kernel_percpu::Thread;
//! struct Init;
//!
//! fn getpid(_: &Init, _: &Thread, _: [usize; 4]) -> Result<usize, Errno> {
//!     Ok(1)
//! }
//!
//! let table = SyscallTable::new().with(Sysno::Getpid, Handler::Args(getpid));
//! assert!(table.is_registered(Sysno::Getpid));
//! assert!(!table.is_registered(Sysno::Read));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod abi;
mod dispatch;
mod errno;
mod table;
pub mod user_copy;

pub use abi::{HandlerKind, NeedsBigLock, SYSCALL_VECTOR, Sysno};
pub use dispatch::{handle, handle_syscall_trap, syscall_entry};
pub use errno::{Errno, encode_result, is_error};
pub use table::{
    ArgsHandler, Descriptor, Handler, NoReturnHandler, Process, RegistersHandler, SyscallTable,
};
pub use user_copy::{UserCopyError, UserMemory};
