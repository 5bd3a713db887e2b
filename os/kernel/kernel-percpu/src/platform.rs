//! Services the per-core substrate consumes but does not implement.
//!
//! A kernel wires these up once: the architecture backend provides [`Arch`]
//! and [`InterruptController`], the scheduler provides [`Scheduler`], the
//! virtual memory layer provides [`MemoryManager`]. Anything implementing all
//! four is a [`Platform`].

use crate::descriptor::DescriptorTable;
use crate::features::{CpuFeatures, CpuidResult};
use crate::thread::Thread;
use crate::CoreId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Physical address of a top-level page table; identifies an address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct PageDirectoryId(pub PhysicalAddress);

impl PageDirectoryId {
    #[must_use]
    pub const fn new(root: u64) -> Self {
        Self(PhysicalAddress::new(root))
    }
}

/// Instruction-level operations on the executing core.
pub trait Arch: Sync {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Turn on the extensions present in `features` (SSE state, NX, SMEP, ...).
    fn enable_extensions(&self, core: CoreId, features: CpuFeatures);

    fn install_descriptor_table(&self, core: CoreId, table: &DescriptorTable);

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Drop the translation for one page from this core's TLB.
    fn invalidate_page(&self, core: CoreId, vaddr: VirtualAddress);

    /// Stop this core for good.
    fn halt_this(&self, core: CoreId) -> !;

    /// Save the register context of `from` and resume `to`.
    ///
    /// # Safety
    /// Interrupts must be disabled and `to` must hold a context that was
    /// saved by a previous switch or prepared for a first entry.
    unsafe fn switch_execution_context(&self, core: CoreId, from: &'static Thread, to: &'static Thread);
}

pub trait InterruptController: Sync {
    /// Raise the messaging vector on `target`.
    fn send_ipi(&self, target: CoreId);

    /// Raise the messaging vector on every core except `sender`.
    fn broadcast_ipi(&self, sender: CoreId);
}

pub trait Scheduler: Sync {
    /// Ask the scheduler to pick a new thread on `core` at the next safe point.
    fn invoke_async(&self, core: CoreId);

    /// Monotonic time used for user/kernel time accounting.
    fn current_time(&self) -> u64;

    /// `thread` became current on `core` after its first switch.
    fn enter_current(&self, core: CoreId, thread: &'static Thread, first: bool);
}

pub trait MemoryManager: Sync {
    fn active_page_directory(&self, core: CoreId) -> PageDirectoryId;

    /// Whether `page_directory` is, or may become, active on another core.
    fn may_be_active_elsewhere(&self, page_directory: PageDirectoryId) -> bool;

    #[inline]
    fn is_user_range(&self, vaddr: VirtualAddress, len: u64) -> bool {
        kernel_memory_addresses::is_user_range(vaddr, len)
    }
}

/// Everything a [`Processors`](crate::Processors) registry needs.
pub trait Platform: Arch + InterruptController + Scheduler + MemoryManager {}

impl<T> Platform for T where T: Arch + InterruptController + Scheduler + MemoryManager {}

/// Disables interrupts for its lifetime and restores the previous state on drop.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptDisabler<'a, A: Arch + ?Sized> {
    arch: &'a A,
    was_enabled: bool,
}

impl<'a, A: Arch + ?Sized> InterruptDisabler<'a, A> {
    pub fn new(arch: &'a A) -> Self {
        let was_enabled = arch.interrupts_enabled();
        if was_enabled {
            arch.disable_interrupts();
        }
        Self { arch, was_enabled }
    }
}

impl<A: Arch + ?Sized> Drop for InterruptDisabler<'_, A> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.arch.enable_interrupts();
        }
    }
}
