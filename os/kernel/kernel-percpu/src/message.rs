use crate::platform::PageDirectoryId;
use alloc::boxed::Box;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Work shipped to another core. Must not block: it runs inside the
/// receiver's interrupt path.
pub type Callback = Box<dyn Fn() + Send + Sync + 'static>;

/// Payload of a message slot.
pub enum Message {
    /// Run on every receiver. A broadcast invokes the same closure once per core.
    Callback(Callback),
    /// Drop `page_count` pages starting at `vaddr` from the receiver's TLB.
    FlushTlb {
        page_directory: PageDirectoryId,
        vaddr: VirtualAddress,
        page_count: usize,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::FlushTlb {
                page_directory,
                vaddr,
                page_count,
            } => f
                .debug_struct("FlushTlb")
                .field("page_directory", &page_directory.0)
                .field("vaddr", vaddr)
                .field("page_count", page_count)
                .finish(),
        }
    }
}
