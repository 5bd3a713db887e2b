//! Per-core records and the registry that owns them.

use crate::deferred::DeferredQueue;
use crate::descriptor::DescriptorTable;
use crate::features::{self, CpuFeatures, HyperVInfo, HypervisorSignature};
use crate::message_pool::{MESSAGES_PER_CORE, MessagePool, PendingQueue};
use crate::platform::{Platform, Scheduler};
use crate::thread::Thread;
use crate::CoreId;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Index;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering};
use log::{info, warn};

/// Upper bound on cores; the idle set is a 64-bit mask.
pub const MAX_CORES: usize = 64;

/// State of one core.
///
/// Everything except the pending message queue and the halt flag is written
/// only by the owning core, usually with interrupts disabled. Other cores may
/// read the atomics for diagnostics.
#[repr(C, align(64))]
pub struct Processor {
    id: CoreId,
    features: AtomicU32,
    physical_address_bits: AtomicU8,
    pub(crate) in_critical: AtomicU32,
    pub(crate) in_irq: AtomicU32,
    current_thread: AtomicPtr<Thread>,
    pub(crate) halt_requested: AtomicBool,
    pub(crate) invoke_scheduler_async: AtomicBool,
    pub(crate) scheduler_initialized: AtomicBool,
    /// Messages posted by other cores; written concurrently.
    pub(crate) pending: PendingQueue,
    pub(crate) deferred: DeferredQueue,
}

impl Processor {
    fn new(id: CoreId) -> Self {
        Self {
            id,
            features: AtomicU32::new(0),
            physical_address_bits: AtomicU8::new(0),
            in_critical: AtomicU32::new(0),
            in_irq: AtomicU32::new(0),
            current_thread: AtomicPtr::new(ptr::null_mut()),
            halt_requested: AtomicBool::new(false),
            invoke_scheduler_async: AtomicBool::new(false),
            scheduler_initialized: AtomicBool::new(false),
            pending: PendingQueue::new(),
            deferred: DeferredQueue::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CoreId {
        self.id
    }

    #[must_use]
    pub fn features(&self) -> CpuFeatures {
        CpuFeatures::from_bits(self.features.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn physical_address_bits(&self) -> u8 {
        self.physical_address_bits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_thread(&self) -> Option<&'static Thread> {
        let thread = self.current_thread.load(Ordering::Relaxed);
        // Safety: only ever set from `&'static Thread`.
        unsafe { thread.as_ref() }
    }

    #[must_use]
    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_pending_messages(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("in_critical", &self.in_critical.load(Ordering::Relaxed))
            .field("in_irq", &self.in_irq.load(Ordering::Relaxed))
            .field("thread", &self.current_thread().map(Thread::id))
            .field("halt_requested", &self.is_halt_requested())
            .finish_non_exhaustive()
    }
}

/// Registry of every core plus the shared message pool.
///
/// Built once at boot, before any core but the bootstrap processor runs;
/// cores are addressed by dense ids `0..count`.
pub struct Processors<P: Platform> {
    platform: P,
    cores: Box<[Processor]>,
    pool: MessagePool,
    smp_enabled: AtomicBool,
    pub(crate) idle_mask: AtomicU64,
}

impl<P: Platform> Processors<P> {
    /// # Panics
    /// If `count` is zero or exceeds [`MAX_CORES`].
    #[must_use]
    pub fn new(platform: P, count: usize) -> Self {
        assert!(
            (1..=MAX_CORES).contains(&count),
            "unsupported core count {count}"
        );
        let cores: Vec<Processor> = (0..count)
            .map(|id| {
                let Ok(id) = CoreId::try_from(id) else {
                    unreachable!("core ids fit CoreId");
                };
                Processor::new(id)
            })
            .collect();
        Self {
            platform,
            cores: cores.into_boxed_slice(),
            pool: MessagePool::new(count * MESSAGES_PER_CORE, count),
            smp_enabled: AtomicBool::new(false),
            idle_mask: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.cores.len()
    }

    #[must_use]
    pub fn get(&self, id: CoreId) -> Option<&Processor> {
        self.cores.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Processor> {
        self.cores.iter()
    }

    /// Handle for code running on core `id`.
    ///
    /// # Panics
    /// If `id` is out of range.
    #[must_use]
    pub fn core(&self, id: CoreId) -> Core<'_, P> {
        Core {
            processors: self,
            processor: &self[id],
        }
    }

    /// Open messaging once every core is online.
    pub fn smp_enable(&self) {
        self.smp_enabled.store(true, Ordering::Release);
        info!("SMP: messaging enabled for {} cores", self.count());
    }

    #[must_use]
    pub fn is_smp_enabled(&self) -> bool {
        self.smp_enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn message_pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Cores that announced themselves idle, one bit per id.
    #[must_use]
    pub fn idle_mask(&self) -> u64 {
        self.idle_mask.load(Ordering::Relaxed)
    }
}

impl<P: Platform> Index<CoreId> for Processors<P> {
    type Output = Processor;

    fn index(&self, id: CoreId) -> &Processor {
        match self.get(id) {
            Some(p) => p,
            None => panic!("no core {id} ({} cores)", self.count()),
        }
    }
}

/// The core the caller is running on.
///
/// Operations that mutate owner-only state go through this handle; the
/// caller asserts, by constructing it, that it is executing on that core.
pub struct Core<'a, P: Platform> {
    pub(crate) processors: &'a Processors<P>,
    pub(crate) processor: &'a Processor,
}

impl<P: Platform> Clone for Core<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for Core<'_, P> {}

impl<'a, P: Platform> Core<'a, P> {
    #[must_use]
    pub const fn id(&self) -> CoreId {
        self.processor.id
    }

    #[must_use]
    pub const fn processor(&self) -> &'a Processor {
        self.processor
    }

    #[must_use]
    pub const fn processors(&self) -> &'a Processors<P> {
        self.processors
    }

    #[must_use]
    pub const fn platform(&self) -> &'a P {
        &self.processors.platform
    }

    pub(crate) const fn pool(&self) -> &'a MessagePool {
        &self.processors.pool
    }

    pub(crate) const fn deferred(&self) -> &'a DeferredQueue {
        &self.processor.deferred
    }

    #[must_use]
    pub fn current_thread(&self) -> Option<&'static Thread> {
        self.processor.current_thread()
    }

    pub fn set_current_thread(&self, thread: &'static Thread) {
        self.processor
            .current_thread
            .store(ptr::from_ref(thread).cast_mut(), Ordering::Relaxed);
    }

    /// Reset per-core state, detect features and load the descriptor table.
    ///
    /// # Panics
    /// If the core reports SSE without FXSR.
    pub fn early_initialize(&self) {
        let p = self.processor;
        p.in_critical.store(0, Ordering::Relaxed);
        p.in_irq.store(0, Ordering::Relaxed);
        p.invoke_scheduler_async.store(false, Ordering::Relaxed);
        p.scheduler_initialized.store(false, Ordering::Relaxed);
        p.halt_requested.store(false, Ordering::Relaxed);
        p.current_thread.store(ptr::null_mut(), Ordering::Relaxed);
        p.deferred.reset(self.id());

        let arch = self.platform();
        let detected = features::detect(|leaf, subleaf| arch.cpuid(leaf, subleaf));
        p.features
            .store(detected.features.into_bits(), Ordering::Relaxed);
        p.physical_address_bits
            .store(detected.physical_address_bits, Ordering::Relaxed);

        if detected.features.sse() {
            assert!(
                detected.features.fxsr(),
                "CPU[{}]: SSE without FXSR is not supported",
                self.id()
            );
        }
        arch.enable_extensions(self.id(), detected.features);
        arch.install_descriptor_table(self.id(), &DescriptorTable::standard());
    }

    /// Report what [`early_initialize`](Self::early_initialize) found.
    pub fn initialize(&self) {
        let p = self.processor;
        let features = p.features();
        info!("CPU[{}]: Supported features: {features}", self.id());
        if !features.rdrand() {
            warn!("CPU[{}]: No RDRAND support detected, randomness will be poor", self.id());
        }
        info!(
            "CPU[{}]: Physical address bit width: {}",
            self.id(),
            p.physical_address_bits()
        );
        if self.id() == 0 && features.hypervisor() {
            let arch = self.platform();
            let cpuid = |leaf, subleaf| arch.cpuid(leaf, subleaf);
            let signature = HypervisorSignature::read(cpuid);
            info!(
                "CPU[{}]: CPUID hypervisor signature '{}', max leaf {:#x}",
                self.id(),
                signature.as_str().unwrap_or("?"),
                signature.max_leaf
            );
            if let Some(hyperv) = HyperVInfo::read(&signature, cpuid) {
                self.report_hyperv(&hyperv);
            }
        }
    }

    fn report_hyperv(&self, hyperv: &HyperVInfo) {
        info!(
            "CPU[{}]: Hyper-V interface signature '{}' ({:#x})",
            self.id(),
            hyperv.interface_signature().unwrap_or("?"),
            hyperv.interface()
        );
        if let Some(identity) = hyperv.system_identity {
            info!(
                "CPU[{}]: Hyper-V system identity {}.{}, build number {}",
                self.id(),
                identity.major,
                identity.minor,
                identity.build
            );
        }
        if hyperv.is_conformant() {
            info!("CPU[{}]: Hyper-V hypervisor detected", self.id());
        }
    }

    /// Switch from `from` to `to` on this core.
    ///
    /// `from`'s critical depth is saved with it and `to`'s restored, and the
    /// current thread is updated before `to` runs its first instruction.
    ///
    /// # Panics
    /// If interrupts are enabled or `to` was saved outside a critical section.
    ///
    /// # Safety
    /// As for [`Arch::switch_execution_context`](crate::Arch::switch_execution_context).
    pub unsafe fn switch_context(&self, from: &'static Thread, to: &'static Thread) {
        assert!(
            !self.interrupts_enabled(),
            "CPU[{}]: context switch with interrupts enabled",
            self.id()
        );
        from.save_critical(self.in_critical());
        self.set_current_thread(to);
        let depth = to.saved_critical();
        assert!(
            depth > 0,
            "CPU[{}]: thread {} resumed outside a critical section",
            self.id(),
            to.id()
        );
        self.restore_critical(depth);
        // Safety: forwarded to the caller.
        unsafe { self.platform().switch_execution_context(self.id(), from, to) };
    }

    /// Bookkeeping for the very first entry into `to`, which must already be
    /// the current thread.
    ///
    /// # Panics
    /// If interrupts are enabled or `to` is not current.
    pub fn first_switch(&self, from: &'static Thread, to: &'static Thread) {
        assert!(
            !self.interrupts_enabled(),
            "CPU[{}]: first switch with interrupts enabled",
            self.id()
        );
        assert!(
            self.current_thread().is_some_and(|t| ptr::eq(t, to)),
            "CPU[{}]: first switch into a thread that is not current",
            self.id()
        );
        Scheduler::enter_current(self.platform(), self.id(), from, true);
        let depth = to.saved_critical();
        assert!(depth > 0, "CPU[{}]: first switch outside a critical section", self.id());
        self.restore_critical(depth);
    }
}
