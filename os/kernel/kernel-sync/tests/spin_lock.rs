use kernel_sync::{Backoff, SpinLock};
use std::{panic, thread};

const CORE0: u64 = 0;
const CORE1: u64 = 1;

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock(CORE0);
        *g = 41;
        assert!(l.is_owned_by(CORE0));
    }

    // lock again from elsewhere; previous drop must have unlocked
    {
        let mut g = l.lock(CORE1);
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(!l.is_locked());
}

#[test]
fn relocking_by_the_holder_panics_instead_of_hanging() {
    let l = SpinLock::new(());
    let _held = l.lock(CORE0);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _again = l.lock(CORE0);
    }));
    let payload = res.expect_err("self re-acquire must be fatal");
    let msg = payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(msg.contains("re-acquired"), "unexpected panic message: {msg}");

    // first holder is unaffected
    assert!(l.is_owned_by(CORE0));
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(CORE0, |s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = l.with_lock(CORE0, |s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for id in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(id as u64, |v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(CORE0, |v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(CORE0, |v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert!(!l.is_locked());
    assert_eq!(l.with_lock(CORE0, |v| *v), 123);
}

#[test]
#[should_panic(expected = "reserved")]
fn reserved_owner_token_is_rejected() {
    let l = SpinLock::new(());
    let _g = l.lock(u64::MAX);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}

#[test]
fn backoff_saturates_and_resets() {
    let mut b = Backoff::new();
    let mut steps = 0;
    while !b.is_saturated() {
        b.spin();
        steps += 1;
    }
    assert_eq!(steps, kernel_sync::SPIN_LIMIT);

    // further spins stay bounded at the limit
    b.spin();
    assert!(b.is_saturated());

    b.reset();
    assert!(!b.is_saturated());
}
