//! Host-side platform: every simulated core is an OS thread.
//!
//! Interrupt enable state is per OS thread. Inter-processor interrupts set a
//! per-core flag that the core's thread polls with [`service`]; taking one
//! runs a full trap envelope, so messages are drained exactly where real
//! hardware would drain them. Halting a simulated core unwinds its thread with
//! a [`Halted`] payload.

use crate::{
    Arch, Core, CoreId, CpuFeatures, CpuidResult, DescriptorTable, InterruptController,
    MemoryManager, PageDirectoryId, Processors, RegisterState, Scheduler, Thread, ThreadId,
};
use kernel_memory_addresses::VirtualAddress;
use std::boxed::Box;
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::vec::Vec;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Unwind payload of a simulated core that was halted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Halted(pub CoreId);

/// Address space every simulated core starts out with.
pub const DEFAULT_PAGE_DIRECTORY: PageDirectoryId = PageDirectoryId::new(0x1000);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimPlatform {
    cpuid: fn(u32, u32) -> CpuidResult,
    ipi_pending: Box<[AtomicBool]>,
    ipis_received: Box<[AtomicUsize]>,
    broadcasts: AtomicUsize,
    active_space: Box<[AtomicU64]>,
    shared_spaces: Mutex<HashSet<PageDirectoryId>>,
    flushes: Mutex<Vec<(CoreId, VirtualAddress)>>,
    scheduler_invocations: Box<[AtomicUsize]>,
    clock: AtomicU64,
    tables_installed: AtomicUsize,
    extensions: Mutex<Vec<(CoreId, CpuFeatures)>>,
    switches: Mutex<Vec<(CoreId, ThreadId, ThreadId)>>,
    entered: Mutex<Vec<(CoreId, ThreadId, bool)>>,
    interrupt_masks: AtomicUsize,
}

impl SimPlatform {
    #[must_use]
    pub fn new(cores: usize) -> Self {
        Self {
            cpuid: modern_cpu,
            ipi_pending: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            ipis_received: (0..cores).map(|_| AtomicUsize::new(0)).collect(),
            broadcasts: AtomicUsize::new(0),
            active_space: (0..cores)
                .map(|_| AtomicU64::new(DEFAULT_PAGE_DIRECTORY.0.as_u64()))
                .collect(),
            shared_spaces: Mutex::new(HashSet::new()),
            flushes: Mutex::new(Vec::new()),
            scheduler_invocations: (0..cores).map(|_| AtomicUsize::new(0)).collect(),
            clock: AtomicU64::new(0),
            tables_installed: AtomicUsize::new(0),
            extensions: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
            entered: Mutex::new(Vec::new()),
            interrupt_masks: AtomicUsize::new(0),
        }
    }

    /// Replace the CPUID responses every simulated core reports.
    #[must_use]
    pub fn with_cpuid(mut self, cpuid: fn(u32, u32) -> CpuidResult) -> Self {
        self.cpuid = cpuid;
        self
    }

    /// Consume a pending interrupt on `core`.
    pub fn take_ipi(&self, core: CoreId) -> bool {
        self.ipi_pending[core as usize].swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn ipis_received(&self, core: CoreId) -> usize {
        self.ipis_received[core as usize].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub fn set_active_page_directory(&self, core: CoreId, page_directory: PageDirectoryId) {
        self.active_space[core as usize].store(page_directory.0.as_u64(), Ordering::Relaxed);
    }

    /// Report `page_directory` as possibly live on other cores.
    pub fn share_page_directory(&self, page_directory: PageDirectoryId) {
        lock(&self.shared_spaces).insert(page_directory);
    }

    /// Every page invalidated so far, in order, with the core that did it.
    #[must_use]
    pub fn flushes(&self) -> Vec<(CoreId, VirtualAddress)> {
        lock(&self.flushes).clone()
    }

    #[must_use]
    pub fn flushes_on(&self, core: CoreId) -> Vec<VirtualAddress> {
        lock(&self.flushes)
            .iter()
            .filter(|(c, _)| *c == core)
            .map(|(_, va)| *va)
            .collect()
    }

    #[must_use]
    pub fn scheduler_invocations(&self, core: CoreId) -> usize {
        self.scheduler_invocations[core as usize].load(Ordering::Relaxed)
    }

    pub fn advance_clock(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::Relaxed);
    }

    #[must_use]
    pub fn descriptor_tables_installed(&self) -> usize {
        self.tables_installed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn enabled_extensions(&self) -> Vec<(CoreId, CpuFeatures)> {
        lock(&self.extensions).clone()
    }

    #[must_use]
    pub fn switches(&self) -> Vec<(CoreId, ThreadId, ThreadId)> {
        lock(&self.switches).clone()
    }

    /// How often any core turned its interrupts off.
    #[must_use]
    pub fn interrupt_masks(&self) -> usize {
        self.interrupt_masks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn entered_threads(&self) -> Vec<(CoreId, ThreadId, bool)> {
        lock(&self.entered).clone()
    }
}

impl Arch for SimPlatform {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        (self.cpuid)(leaf, subleaf)
    }

    fn enable_extensions(&self, core: CoreId, features: CpuFeatures) {
        lock(&self.extensions).push((core, features));
    }

    fn install_descriptor_table(&self, _core: CoreId, table: &DescriptorTable) {
        assert_eq!(table, &DescriptorTable::standard());
        self.tables_installed.fetch_add(1, Ordering::Relaxed);
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.with(Cell::get)
    }

    fn disable_interrupts(&self) {
        self.interrupt_masks.fetch_add(1, Ordering::Relaxed);
        INTERRUPTS_ENABLED.with(|f| f.set(false));
    }

    fn enable_interrupts(&self) {
        INTERRUPTS_ENABLED.with(|f| f.set(true));
    }

    fn invalidate_page(&self, core: CoreId, vaddr: VirtualAddress) {
        lock(&self.flushes).push((core, vaddr));
    }

    fn halt_this(&self, core: CoreId) -> ! {
        std::panic::resume_unwind(Box::new(Halted(core)))
    }

    unsafe fn switch_execution_context(&self, core: CoreId, from: &'static Thread, to: &'static Thread) {
        lock(&self.switches).push((core, from.id(), to.id()));
    }
}

impl InterruptController for SimPlatform {
    fn send_ipi(&self, target: CoreId) {
        self.ipis_received[target as usize].fetch_add(1, Ordering::Relaxed);
        self.ipi_pending[target as usize].store(true, Ordering::Release);
    }

    fn broadcast_ipi(&self, sender: CoreId) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        for (core, pending) in self.ipi_pending.iter().enumerate() {
            if core != sender as usize {
                self.ipis_received[core].fetch_add(1, Ordering::Relaxed);
                pending.store(true, Ordering::Release);
            }
        }
    }
}

impl Scheduler for SimPlatform {
    fn invoke_async(&self, core: CoreId) {
        self.scheduler_invocations[core as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn current_time(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn enter_current(&self, core: CoreId, thread: &'static Thread, first: bool) {
        lock(&self.entered).push((core, thread.id(), first));
    }
}

impl MemoryManager for SimPlatform {
    fn active_page_directory(&self, core: CoreId) -> PageDirectoryId {
        PageDirectoryId::new(self.active_space[core as usize].load(Ordering::Relaxed))
    }

    fn may_be_active_elsewhere(&self, page_directory: PageDirectoryId) -> bool {
        lock(&self.shared_spaces).contains(&page_directory)
    }
}

/// Run `f` with this thread's simulated interrupts disabled.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was = INTERRUPTS_ENABLED.with(|e| e.replace(false));
    let r = f();
    INTERRUPTS_ENABLED.with(|e| e.set(was));
    r
}

/// Deliver one interrupt to `core` from kernel mode.
pub fn simulate_interrupt(core: &Core<'_, SimPlatform>) {
    with_interrupts_disabled(|| core.handle_interrupt(&RegisterState::kernel(), |_| {}));
}

/// Take a pending interrupt, if any; returns whether one was taken.
pub fn service(core: &Core<'_, SimPlatform>) -> bool {
    if core.platform().take_ipi(core.id()) {
        simulate_interrupt(core);
        true
    } else {
        false
    }
}

/// Keep taking interrupts on `core` until `stop` is set, then once more.
pub fn serve_until(core: &Core<'_, SimPlatform>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if !service(core) {
            thread::yield_now();
        }
    }
    service(core);
}

/// Run `f` once per core, each on its own thread, and collect the outcomes.
pub fn run_cores<R: Send>(
    processors: &Processors<SimPlatform>,
    f: impl Fn(Core<'_, SimPlatform>) -> R + Sync,
) -> Vec<thread::Result<R>> {
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = (0..processors.count())
            .map(|id| {
                let Ok(id) = CoreId::try_from(id) else {
                    unreachable!("core ids fit CoreId");
                };
                s.spawn(move || f(processors.core(id)))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    })
}

/// The unwind payload of a simulated core that halted, if that is how it ended.
#[must_use]
pub fn halted_core(payload: &(dyn std::any::Any + Send)) -> Option<CoreId> {
    payload.downcast_ref::<Halted>().map(|h| h.0)
}

/// A recent hypervisor guest: SSE through AVX, NX, SMEP/SMAP, 40-bit PA.
#[must_use]
pub fn modern_cpu(leaf: u32, _subleaf: u32) -> CpuidResult {
    use crate::features::*;
    match leaf {
        LEAF_BASIC_MAX => CpuidResult {
            eax: 0x16,
            ..CpuidResult::default()
        },
        LEAF_01H => CpuidResult {
            eax: 0x0005_06E3,
            ebx: 0,
            ecx: 0xFFFA_FBBF,
            edx: 0xBFEB_FBFF,
        },
        LEAF_07H => CpuidResult {
            ebx: 0x029C_67AF,
            ecx: 0x0000_0004,
            ..CpuidResult::default()
        },
        LEAF_HYPERVISOR => CpuidResult {
            eax: 0x4000_0001,
            ebx: u32::from_le_bytes(*b"SimP"),
            ecx: u32::from_le_bytes(*b"latf"),
            edx: u32::from_le_bytes(*b"orm\0"),
        },
        LEAF_EXTENDED_MAX => CpuidResult {
            eax: 0x8000_0008,
            ..CpuidResult::default()
        },
        LEAF_8000_0001H => CpuidResult {
            edx: 0x2C10_0800,
            ..CpuidResult::default()
        },
        LEAF_8000_0007H => CpuidResult {
            edx: 0x0000_0100,
            ..CpuidResult::default()
        },
        LEAF_8000_0008H => CpuidResult {
            eax: 0x0000_3028,
            ..CpuidResult::default()
        },
        _ => CpuidResult::default(),
    }
}
