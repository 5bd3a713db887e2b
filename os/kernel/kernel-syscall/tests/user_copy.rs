use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::Errno;
use kernel_syscall::user_copy::{
    AtomicOp, TimeFormat, UserCopyError, UserMemory, copy_from_user, copy_string_from_user,
    copy_time_from_user, copy_to_user, memset_user, user_atomic_compare_exchange_relaxed,
    user_atomic_exchange_relaxed, user_atomic_fetch_add_relaxed, user_atomic_fetch_and_not_relaxed,
    user_atomic_fetch_and_relaxed, user_atomic_fetch_or_relaxed, user_atomic_fetch_xor_relaxed,
    user_atomic_load_relaxed, user_atomic_store_relaxed,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const BASE: u64 = 0x0040_0000;

/// One mapped window of user memory; everything else faults.
struct FakeUserMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
    access_allowed: AtomicBool,
    accesses: AtomicUsize,
}

impl FakeUserMemory {
    fn new(len: usize) -> Self {
        Self {
            base: BASE,
            bytes: Mutex::new(vec![0; len]),
            access_allowed: AtomicBool::new(false),
            accesses: AtomicUsize::new(0),
        }
    }

    fn at(offset: u64) -> VirtualAddress {
        VirtualAddress::new(BASE + offset)
    }

    fn poke(&self, offset: usize, data: &[u8]) {
        self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock().unwrap()[offset..offset + len].to_vec()
    }

    /// Offset of `addr` if `len` bytes from there are mapped, else the first
    /// unmapped address.
    fn offset(&self, addr: VirtualAddress, len: usize) -> Result<usize, VirtualAddress> {
        assert!(
            self.access_allowed.load(Ordering::SeqCst),
            "user memory touched without a guard"
        );
        self.accesses.fetch_add(1, Ordering::SeqCst);
        let size = self.bytes.lock().unwrap().len() as u64;
        let start = addr.as_u64();
        let end = self.base + size;
        if start < self.base || start >= end {
            return Err(addr);
        }
        let len = len as u64;
        if start + len > end {
            return Err(VirtualAddress::new(end));
        }
        Ok((start - self.base) as usize)
    }
}

unsafe impl UserMemory for FakeUserMemory {
    fn allow_user_access(&self) {
        assert!(!self.access_allowed.swap(true, Ordering::SeqCst), "nested user access");
    }

    fn forbid_user_access(&self) {
        self.access_allowed.store(false, Ordering::SeqCst);
    }

    fn read(&self, src: VirtualAddress, dst: &mut [u8]) -> Result<(), VirtualAddress> {
        let offset = self.offset(src, dst.len())?;
        dst.copy_from_slice(&self.bytes.lock().unwrap()[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, dst: VirtualAddress, src: &[u8]) -> Result<(), VirtualAddress> {
        let offset = self.offset(dst, src.len())?;
        self.bytes.lock().unwrap()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn fill(&self, dst: VirtualAddress, value: u8, len: usize) -> Result<(), VirtualAddress> {
        let offset = self.offset(dst, len)?;
        self.bytes.lock().unwrap()[offset..offset + len].fill(value);
        Ok(())
    }

    fn strnlen(&self, src: VirtualAddress, max: usize) -> Result<usize, VirtualAddress> {
        let offset = self.offset(src, 0)?;
        let bytes = self.bytes.lock().unwrap();
        let window = &bytes[offset..];
        match window.iter().take(max).position(|&b| b == 0) {
            Some(len) => Ok(len),
            None if window.len() >= max => Ok(max),
            None => Err(VirtualAddress::new(self.base + bytes.len() as u64)),
        }
    }

    fn atomic_u32(&self, addr: VirtualAddress, op: AtomicOp) -> Result<u32, VirtualAddress> {
        let offset = self.offset(addr, 4)?;
        let mut bytes = self.bytes.lock().unwrap();
        let word = &mut bytes[offset..offset + 4];
        let previous = u32::from_le_bytes(word.try_into().unwrap());
        word.copy_from_slice(&op.apply(previous).to_le_bytes());
        Ok(previous)
    }
}

#[test]
fn copies_round_trip_through_user_memory() {
    let memory = FakeUserMemory::new(0x100);
    copy_to_user(&memory, FakeUserMemory::at(0x10), b"hello").unwrap();

    let mut back = [0u8; 5];
    copy_from_user(&memory, &mut back, FakeUserMemory::at(0x10)).unwrap();
    assert_eq!(&back, b"hello");

    memset_user(&memory, FakeUserMemory::at(0x11), b'_', 3).unwrap();
    assert_eq!(memory.peek(0x10, 5), b"h___o");
    assert!(!memory.access_allowed.load(Ordering::SeqCst));
}

#[test]
fn kernel_addresses_are_refused_without_access() {
    let memory = FakeUserMemory::new(0x100);
    let kernel = VirtualAddress::new(0xFFFF_8000_0000_1000);
    let mut buf = [0u8; 8];

    assert_eq!(
        copy_from_user(&memory, &mut buf, kernel),
        Err(UserCopyError::NotUserRange { base: kernel, len: 8 })
    );
    // straddles the top of user space
    let top = VirtualAddress::new(0x7FFF_FFFF_FFFC);
    assert!(copy_to_user(&memory, top, &buf).is_err());
    assert!(memset_user(&memory, VirtualAddress::new(0), 0, 1).is_err());
    assert_eq!(memory.accesses.load(Ordering::SeqCst), 0);
}

#[test]
fn faults_report_the_first_bad_address() {
    let memory = FakeUserMemory::new(0x100);
    let mut buf = [0u8; 0x20];
    let err = copy_from_user(&memory, &mut buf, FakeUserMemory::at(0xF0)).unwrap_err();
    assert_eq!(err, UserCopyError::Fault { fault_at: FakeUserMemory::at(0x100) });
    assert_eq!(Errno::from(err), Errno::EFAULT);
    assert!(!memory.access_allowed.load(Ordering::SeqCst), "guard outlived the fault");
}

#[test]
fn strings_stop_at_nul_or_the_limit() {
    let memory = FakeUserMemory::new(0x100);
    memory.poke(0, b"/bin/init\0garbage");

    assert_eq!(copy_string_from_user(&memory, FakeUserMemory::at(0), 64).unwrap(), "/bin/init");
    assert_eq!(copy_string_from_user(&memory, FakeUserMemory::at(0), 4).unwrap(), "/bin");
    assert_eq!(copy_string_from_user(&memory, FakeUserMemory::at(9), 8).unwrap(), "");
}

#[test]
fn unreadable_or_invalid_strings_are_rejected() {
    let memory = FakeUserMemory::new(0x10);
    memory.poke(0, &[b'a'; 0x10]);
    // runs off the end of the mapping
    assert_eq!(
        copy_string_from_user(&memory, FakeUserMemory::at(0), 0x40),
        Err(Errno::EFAULT)
    );
    assert_eq!(
        copy_string_from_user(&memory, VirtualAddress::new(0xFFFF_8000_0000_0000), 4),
        Err(Errno::EFAULT)
    );
    memory.poke(0, &[0xFF, 0xFE, 0]);
    assert_eq!(
        copy_string_from_user(&memory, FakeUserMemory::at(0), 8),
        Err(Errno::EINVAL)
    );
}

fn time_bytes(sec: i64, frac: i64) -> Vec<u8> {
    [sec.to_le_bytes(), frac.to_le_bytes()].concat()
}

#[test]
fn time_values_are_decoded_and_validated() {
    let memory = FakeUserMemory::new(0x40);
    memory.poke(0, &time_bytes(3, 250_000_000));
    memory.poke(0x10, &time_bytes(2, 500_000));
    memory.poke(0x20, &time_bytes(1, 1_000_000_000));
    memory.poke(0x30, &time_bytes(-1, 0));

    let at = FakeUserMemory::at;
    assert_eq!(
        copy_time_from_user(&memory, at(0), TimeFormat::Timespec),
        Ok(Duration::from_millis(3250))
    );
    assert_eq!(
        copy_time_from_user(&memory, at(0x10), TimeFormat::Timeval),
        Ok(Duration::from_millis(2500))
    );
    assert_eq!(copy_time_from_user(&memory, at(0x20), TimeFormat::Timespec), Err(Errno::EINVAL));
    assert_eq!(copy_time_from_user(&memory, at(0x30), TimeFormat::Timespec), Err(Errno::EINVAL));
    assert_eq!(copy_time_from_user(&memory, at(0x38), TimeFormat::Timespec), Err(Errno::EFAULT));
}

#[test]
fn user_atomics_update_the_word() {
    let memory = FakeUserMemory::new(0x10);
    let word = FakeUserMemory::at(4);

    assert!(user_atomic_store_relaxed(&memory, word, 0b1010));
    assert_eq!(user_atomic_load_relaxed(&memory, word), Some(0b1010));
    assert_eq!(user_atomic_fetch_or_relaxed(&memory, word, 0b0101), Some(0b1010));
    assert_eq!(user_atomic_fetch_and_relaxed(&memory, word, 0b0111), Some(0b1111));
    assert_eq!(user_atomic_fetch_and_not_relaxed(&memory, word, 0b0001), Some(0b0111));
    assert_eq!(user_atomic_fetch_xor_relaxed(&memory, word, 0b0110), Some(0b0110));
    assert_eq!(user_atomic_fetch_add_relaxed(&memory, word, 10), Some(0));
    assert_eq!(user_atomic_exchange_relaxed(&memory, word, 99), Some(10));
    assert_eq!(memory.peek(4, 4), 99u32.to_le_bytes());
}

#[test]
fn compare_exchange_reports_the_current_value() {
    let memory = FakeUserMemory::new(0x10);
    let word = FakeUserMemory::at(8);
    memory.poke(8, &7u32.to_le_bytes());

    let mut expected = 3;
    assert_eq!(user_atomic_compare_exchange_relaxed(&memory, word, &mut expected, 9), Some(false));
    assert_eq!(expected, 7);
    assert_eq!(user_atomic_compare_exchange_relaxed(&memory, word, &mut expected, 9), Some(true));
    assert_eq!(user_atomic_load_relaxed(&memory, word), Some(9));
}

#[test]
fn misaligned_or_kernel_atomics_never_touch_memory() {
    let memory = FakeUserMemory::new(0x10);
    assert_eq!(user_atomic_load_relaxed(&memory, FakeUserMemory::at(2)), None);
    assert!(!user_atomic_store_relaxed(&memory, FakeUserMemory::at(1), 5));
    let kernel = VirtualAddress::new(0xFFFF_8000_0000_0000);
    assert_eq!(user_atomic_fetch_add_relaxed(&memory, kernel, 1), None);
    let mut expected = 0;
    assert_eq!(
        user_atomic_compare_exchange_relaxed(&memory, kernel, &mut expected, 1),
        None
    );
    assert_eq!(memory.accesses.load(Ordering::SeqCst), 0);

    // aligned and in range, but unmapped
    assert_eq!(user_atomic_load_relaxed(&memory, FakeUserMemory::at(0x100)), None);
    assert_eq!(memory.accesses.load(Ordering::SeqCst), 1);
}
