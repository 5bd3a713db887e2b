use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_percpu::testing::{DEFAULT_PAGE_DIRECTORY, SimPlatform, serve_until};
use kernel_percpu::{CoreId, PageDirectoryId, Processors};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const KERNEL_VA: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0010_0000);
const USER_VA: VirtualAddress = VirtualAddress::new(0x0040_0000);

fn online(cores: usize) -> Processors<SimPlatform> {
    let processors = Processors::new(SimPlatform::new(cores), cores);
    for id in 0..cores {
        processors.core(CoreId::try_from(id).unwrap()).early_initialize();
    }
    processors.smp_enable();
    processors
}

/// Serve interrupts on every core but 0 while `f` runs on core 0.
fn with_peers_serving(processors: &Processors<SimPlatform>, f: impl FnOnce()) {
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        for id in 1..processors.count() {
            let stop = &stop;
            s.spawn(move || serve_until(&processors.core(CoreId::try_from(id).unwrap()), stop));
        }
        f();
        stop.store(true, Ordering::Release);
    });
}

fn pages(base: VirtualAddress, count: usize) -> Vec<VirtualAddress> {
    base.pages::<Size4K>(count).collect()
}

#[test]
fn kernel_ranges_are_flushed_everywhere() {
    let processors = online(3);
    with_peers_serving(&processors, || {
        processors.core(0).flush_tlb(DEFAULT_PAGE_DIRECTORY, KERNEL_VA, 2);
        // synchronous: every peer is done when the call returns
        for id in 0..3 {
            assert_eq!(processors.platform().flushes_on(id), pages(KERNEL_VA, 2));
        }
    });
    assert_eq!(processors.platform().broadcast_count(), 1);
    assert_eq!(processors.message_pool().in_use(), 0);
}

#[test]
fn private_user_ranges_stay_local() {
    let processors = online(3);
    processors.core(0).flush_tlb(DEFAULT_PAGE_DIRECTORY, USER_VA, 3);

    let platform = processors.platform();
    assert_eq!(platform.flushes_on(0), pages(USER_VA, 3));
    assert!(platform.flushes_on(1).is_empty());
    assert!(platform.flushes_on(2).is_empty());
    assert_eq!(platform.broadcast_count(), 0);
    assert_eq!(processors.message_pool().acquired_total(), 0);
}

#[test]
fn shared_user_ranges_skip_cores_running_another_space() {
    let processors = online(3);
    let shared = PageDirectoryId::new(0x0020_0000);
    let platform = processors.platform();
    platform.share_page_directory(shared);
    platform.set_active_page_directory(0, shared);
    platform.set_active_page_directory(1, shared);
    platform.set_active_page_directory(2, PageDirectoryId::new(0x0030_0000));

    with_peers_serving(&processors, || {
        processors.core(0).flush_tlb(shared, USER_VA, 1);
    });

    assert_eq!(platform.flushes_on(0), [USER_VA]);
    assert_eq!(platform.flushes_on(1), [USER_VA]);
    assert!(platform.flushes_on(2).is_empty());
    assert_eq!(processors.message_pool().in_use(), 0);
}

#[test]
fn sender_flushes_a_shared_range_it_is_not_running() {
    let processors = online(3);
    let named = PageDirectoryId::new(0x0020_0000);
    let platform = processors.platform();
    platform.share_page_directory(named);
    platform.set_active_page_directory(0, PageDirectoryId::new(0x0040_0000));
    platform.set_active_page_directory(1, named);
    platform.set_active_page_directory(2, PageDirectoryId::new(0x0030_0000));

    let base = VirtualAddress::new(0x1000);
    with_peers_serving(&processors, || {
        processors.core(0).flush_tlb(named, base, 2);
        // every peer has finished by the time the call returns
        assert_eq!(processors.message_pool().in_use(), 0);
        assert_eq!(platform.flushes_on(1), pages(base, 2));
    });

    assert_eq!(platform.flushes_on(0), [VirtualAddress::new(0x1000), VirtualAddress::new(0x2000)]);
    assert!(platform.flushes_on(2).is_empty());
    assert_eq!(platform.broadcast_count(), 1);
}

#[test]
fn flushes_before_smp_are_local() {
    let processors = Processors::new(SimPlatform::new(2), 2);
    processors.core(1).flush_tlb(DEFAULT_PAGE_DIRECTORY, KERNEL_VA, 1);
    assert_eq!(processors.platform().flushes(), [(1, KERNEL_VA)]);
}

#[test]
fn flush_starts_at_the_containing_page() {
    let processors = online(1);
    processors
        .core(0)
        .flush_tlb_local(VirtualAddress::new(0x0040_0123), 2);
    assert_eq!(processors.platform().flushes_on(0), pages(USER_VA, 2));
}
