//! # Per-core kernel substrate
//!
//! One [`Processor`] record per core, held by a [`Processors`] registry that
//! also owns the shared message pool. Code running on a core works through a
//! [`Core`] handle:
//!
//! - critical sections that keep the scheduler off the core ([`Core::critical`]),
//! - deferred calls run when the outermost critical section ends
//!   ([`Core::deferred_call_queue`]),
//! - cross-core callbacks and TLB shootdowns ([`Core::smp_unicast`],
//!   [`Core::smp_broadcast`], [`Core::flush_tlb`]),
//! - the trap envelope bracketing every interrupt, exception and system call
//!   ([`Core::enter_trap`], [`Core::exit_trap`]),
//! - bring-up ([`Core::early_initialize`]), context switches and halting.
//!
//! Hardware access, scheduling and address spaces are supplied by the kernel
//! through the [`Platform`] traits.
//!
//! ```rust
//! # use kernel_percpu::{Processors, testing::SimPlatform};
//! let processors = Processors::new(SimPlatform::new(2), 2);
//! let core = processors.core(0);
//! core.early_initialize();
//! {
//!     let _critical = core.critical();
//!     assert_eq!(core.in_critical(), 1);
//! }
//! assert_eq!(core.in_critical(), 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;
#[cfg(all(feature = "testing", not(test)))]
extern crate std;

mod critical;
mod deferred;
pub mod descriptor;
mod error;
pub mod features;
mod message;
mod message_pool;
mod platform;
mod processor;
mod smp;
mod thread;
mod trap;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use critical::ScopedCritical;
pub use deferred::DEFERRED_POOL_SIZE;
pub use descriptor::{DescriptorTable, KERNEL_CS, KERNEL_DS, Selector, USER_CS, USER_DS};
pub use error::SmpError;
pub use features::{CpuFeatures, CpuidResult};
pub use message::{Callback, Message};
pub use message_pool::{MESSAGES_PER_CORE, MessagePool};
pub use platform::{
    Arch, InterruptController, InterruptDisabler, MemoryManager, PageDirectoryId, Platform,
    Scheduler,
};
pub use processor::{Core, MAX_CORES, Processor, Processors};
pub use thread::{MAX_TRAP_DEPTH, PreviousMode, SchedulingTimes, Thread, ThreadId};
pub use trap::{RegisterState, Rflags, TrapEnvelope, TrapSource};

/// Dense core index, `0..Processors::count()`.
pub type CoreId = u32;
