//! # CPU feature detection
//!
//! Decodes the CPUID leaves the kernel cares about into a compact
//! [`CpuFeatures`] set. The set is recorded once per core by
//! [`Core::early_initialize`](crate::Core::early_initialize) and later handed to
//! the architecture backend, which enables the matching extensions (SSE state,
//! SMEP/SMAP, NX, ...).
//!
//! Reference: Intel SDM Vol. 2A, "CPUID: CPU Identification".

use bitfield_struct::bitfield;
use core::fmt;

pub const LEAF_BASIC_MAX: u32 = 0x00;
pub const LEAF_01H: u32 = 0x01;
pub const LEAF_07H: u32 = 0x07;
pub const LEAF_HYPERVISOR: u32 = 0x4000_0000;
pub const LEAF_HYPERV_INTERFACE: u32 = 0x4000_0001;
pub const LEAF_HYPERV_SYSTEM_IDENTITY: u32 = 0x4000_0002;
pub const LEAF_HYPERV_IMPLEMENTATION_LIMITS: u32 = 0x4000_0005;
pub const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;
pub const LEAF_8000_0001H: u32 = 0x8000_0001;
pub const LEAF_8000_0007H: u32 = 0x8000_0007;
pub const LEAF_8000_0008H: u32 = 0x8000_0008;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Capability set of one core, in a fixed bit order.
///
/// The order is also the order of [`Display`](fmt::Display), which renders
/// the set as a space-separated list of lower-case names.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct CpuFeatures {
    pub nx: bool,
    pub pae: bool,
    pub pge: bool,
    pub rdrand: bool,
    pub rdseed: bool,
    pub smap: bool,
    pub smep: bool,
    pub sse: bool,
    pub tsc: bool,
    pub rdtscp: bool,
    pub constant_tsc: bool,
    pub nonstop_tsc: bool,
    pub umip: bool,
    pub sep: bool,
    pub syscall: bool,
    pub mmx: bool,
    pub fxsr: bool,
    pub sse2: bool,
    pub sse3: bool,
    pub ssse3: bool,
    pub sse4_1: bool,
    pub sse4_2: bool,
    pub xsave: bool,
    pub avx: bool,
    pub lm: bool,
    pub hypervisor: bool,
    #[bits(6)]
    __reserved: u8,
}

const FEATURE_NAMES: [&str; 26] = [
    "nx",
    "pae",
    "pge",
    "rdrand",
    "rdseed",
    "smap",
    "smep",
    "sse",
    "tsc",
    "rdtscp",
    "constant_tsc",
    "nonstop_tsc",
    "umip",
    "sep",
    "syscall",
    "mmx",
    "fxsr",
    "sse2",
    "sse3",
    "ssse3",
    "sse4.1",
    "sse4.2",
    "xsave",
    "avx",
    "lm",
    "hypervisor",
];

impl CpuFeatures {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    /// Number of features present.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.into_bits().count_ones()
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.into_bits();
        let mut first = true;
        for (bit, name) in FEATURE_NAMES.iter().enumerate() {
            if bits & (1 << bit) == 0 {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// CPUID.01H:EAX: Version Information (base fields only).
#[bitfield(u32)]
pub struct Leaf1Eax {
    #[bits(4)]
    pub stepping: u8,
    #[bits(4)]
    pub model: u8,
    #[bits(4)]
    pub family: u8,
    #[bits(20)]
    __rest: u32,
}

/// CPUID.01H:ECX: the feature flags this kernel consumes.
#[bitfield(u32)]
pub struct Leaf1Ecx {
    pub sse3: bool, // 0
    #[bits(8)]
    __r1_8: u8,
    pub ssse3: bool, // 9
    #[bits(9)]
    __r10_18: u16,
    pub sse4_1: bool, // 19
    pub sse4_2: bool, // 20
    #[bits(5)]
    __r21_25: u8,
    pub xsave: bool, // 26
    pub osxsave: bool, // 27
    pub avx: bool,     // 28
    pub f16c: bool,    // 29
    pub rdrand: bool,  // 30
    pub hypervisor: bool, // 31
}

/// CPUID.01H:EDX: the feature flags this kernel consumes.
#[bitfield(u32)]
pub struct Leaf1Edx {
    #[bits(4)]
    __r0_3: u8,
    pub tsc: bool, // 4
    pub msr: bool, // 5
    pub pae: bool, // 6
    #[bits(4)]
    __r7_10: u8,
    pub sep: bool, // 11
    pub mtrr: bool, // 12
    pub pge: bool,  // 13
    #[bits(9)]
    __r14_22: u16,
    pub mmx: bool,  // 23
    pub fxsr: bool, // 24
    pub sse: bool,  // 25
    pub sse2: bool, // 26
    #[bits(5)]
    __r27_31: u8,
}

/// CPUID.07H.0:EBX: structured extended features.
#[bitfield(u32)]
pub struct Leaf7Ebx {
    #[bits(7)]
    __r0_6: u8,
    pub smep: bool, // 7
    #[bits(10)]
    __r8_17: u16,
    pub rdseed: bool, // 18
    pub adx: bool,    // 19
    pub smap: bool,   // 20
    #[bits(11)]
    __r21_31: u16,
}

/// CPUID.07H.0:ECX: structured extended features.
#[bitfield(u32)]
pub struct Leaf7Ecx {
    #[bits(2)]
    __r0_1: u8,
    pub umip: bool, // 2
    #[bits(29)]
    __r3_31: u32,
}

/// CPUID.80000001H:EDX: extended feature flags.
#[bitfield(u32)]
pub struct Ext1Edx {
    #[bits(11)]
    __r0_10: u16,
    pub syscall: bool, // 11
    #[bits(8)]
    __r12_19: u8,
    pub nx: bool, // 20
    #[bits(6)]
    __r21_26: u8,
    pub rdtscp: bool, // 27
    __r28: bool,
    pub lm: bool, // 29
    #[bits(2)]
    __r30_31: u8,
}

/// CPUID.80000007H:EDX: advanced power management.
#[bitfield(u32)]
pub struct Ext7Edx {
    #[bits(8)]
    __r0_7: u8,
    pub invariant_tsc: bool, // 8
    #[bits(23)]
    __r9_31: u32,
}

/// Result of probing one core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DetectedFeatures {
    pub features: CpuFeatures,
    pub physical_address_bits: u8,
}

/// Probe the capability set through `cpuid(leaf, subleaf)`.
#[must_use]
pub fn detect(cpuid: impl Fn(u32, u32) -> CpuidResult) -> DetectedFeatures {
    let max_basic = cpuid(LEAF_BASIC_MAX, 0).eax;
    let leaf1 = cpuid(LEAF_01H, 0);
    let eax = Leaf1Eax::from_bits(leaf1.eax);
    let ecx = Leaf1Ecx::from_bits(leaf1.ecx);
    let edx = Leaf1Edx::from_bits(leaf1.edx);

    let mut f = CpuFeatures::new()
        .with_tsc(edx.tsc())
        .with_pae(edx.pae())
        .with_pge(edx.pge())
        .with_mmx(edx.mmx())
        .with_fxsr(edx.fxsr())
        .with_sse(edx.sse())
        .with_sse2(edx.sse2())
        .with_sse3(ecx.sse3())
        .with_ssse3(ecx.ssse3())
        .with_sse4_1(ecx.sse4_1())
        .with_sse4_2(ecx.sse4_2())
        .with_xsave(ecx.xsave())
        .with_avx(ecx.avx())
        .with_rdrand(ecx.rdrand())
        .with_hypervisor(ecx.hypervisor());

    if edx.sep() {
        let (family, model, stepping) = (eax.family(), eax.model(), eax.stepping());
        // Early Pentium Pro parts report SEP without a working SYSENTER.
        if !(family == 6 && model < 3 && stepping < 3) {
            f.set_sep(true);
        }
        if (family == 6 && model >= 3) || (family == 0xF && model >= 0xE) {
            f.set_constant_tsc(true);
        }
    }

    let max_extended = cpuid(LEAF_EXTENDED_MAX, 0).eax;
    if max_extended >= LEAF_8000_0001H {
        let ext = Ext1Edx::from_bits(cpuid(LEAF_8000_0001H, 0).edx);
        f.set_nx(ext.nx());
        f.set_rdtscp(ext.rdtscp());
        f.set_lm(ext.lm());
        f.set_syscall(ext.syscall());
    }

    if max_extended >= LEAF_8000_0007H
        && Ext7Edx::from_bits(cpuid(LEAF_8000_0007H, 0).edx).invariant_tsc()
    {
        f.set_constant_tsc(true);
        f.set_nonstop_tsc(true);
    }

    let physical_address_bits = if max_extended >= LEAF_8000_0008H {
        cpuid(LEAF_8000_0008H, 0).eax.to_le_bytes()[0]
    } else if f.pae() {
        36
    } else {
        32
    };

    if max_basic >= LEAF_07H {
        let leaf7 = cpuid(LEAF_07H, 0);
        let ebx = Leaf7Ebx::from_bits(leaf7.ebx);
        f.set_smap(ebx.smap());
        f.set_smep(ebx.smep());
        f.set_rdseed(ebx.rdseed());
        f.set_umip(Leaf7Ecx::from_bits(leaf7.ecx).umip());
    }

    DetectedFeatures {
        features: f,
        physical_address_bits,
    }
}

/// Vendor signature from CPUID leaf `0x4000_0000`, e.g. `"KVMKVMKVM"`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct HypervisorSignature {
    bytes: [u8; 12],
    pub max_leaf: u32,
}

impl HypervisorSignature {
    #[must_use]
    pub fn read(cpuid: impl Fn(u32, u32) -> CpuidResult) -> Self {
        let r = cpuid(LEAF_HYPERVISOR, 0);
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&r.ebx.to_le_bytes());
        bytes[4..8].copy_from_slice(&r.ecx.to_le_bytes());
        bytes[8..12].copy_from_slice(&r.edx.to_le_bytes());
        Self {
            bytes,
            max_leaf: r.eax,
        }
    }

    /// The signature up to the first NUL, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        nul_terminated(&self.bytes)
    }

    #[must_use]
    pub fn is_hyperv(&self) -> bool {
        self.as_str() == Some("Microsoft Hv")
    }
}

fn nul_terminated(bytes: &[u8]) -> Option<&str> {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..len]).ok()
}

/// Hyper-V version as reported by leaf `0x4000_0002`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HyperVSystemIdentity {
    pub major: u16,
    pub minor: u16,
    pub build: u32,
}

/// What a Hyper-V hypervisor tells about itself beyond its signature.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HyperVInfo {
    interface: [u8; 4],
    max_leaf: u32,
    pub system_identity: Option<HyperVSystemIdentity>,
}

impl HyperVInfo {
    /// `None` unless `signature` is Hyper-V's and the interface leaf exists.
    #[must_use]
    pub fn read(
        signature: &HypervisorSignature,
        cpuid: impl Fn(u32, u32) -> CpuidResult,
    ) -> Option<Self> {
        if !signature.is_hyperv() || signature.max_leaf < LEAF_HYPERV_INTERFACE {
            return None;
        }
        let interface = cpuid(LEAF_HYPERV_INTERFACE, 0).eax.to_le_bytes();
        let system_identity = (signature.max_leaf >= LEAF_HYPERV_SYSTEM_IDENTITY).then(|| {
            let r = cpuid(LEAF_HYPERV_SYSTEM_IDENTITY, 0);
            let [b0, b1, b2, b3] = r.ebx.to_le_bytes();
            HyperVSystemIdentity {
                major: u16::from_le_bytes([b2, b3]),
                minor: u16::from_le_bytes([b0, b1]),
                build: r.eax,
            }
        });
        Some(Self {
            interface,
            max_leaf: signature.max_leaf,
            system_identity,
        })
    }

    #[must_use]
    pub const fn interface(&self) -> u32 {
        u32::from_le_bytes(self.interface)
    }

    /// The interface signature, `"Hv#1"` for a conformant hypervisor.
    #[must_use]
    pub fn interface_signature(&self) -> Option<&str> {
        nul_terminated(&self.interface)
    }

    /// Hyper-V proper: the `Hv#1` interface with its implementation limits leaf.
    #[must_use]
    pub fn is_conformant(&self) -> bool {
        self.max_leaf >= LEAF_HYPERV_IMPLEMENTATION_LIMITS
            && self.interface_signature() == Some("Hv#1")
    }
}

impl fmt::Debug for HypervisorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorSignature")
            .field("signature", &self.as_str().unwrap_or("???"))
            .field("max_leaf", &format_args!("{:#x}", self.max_leaf))
            .finish()
    }
}
