//! System call numbers and register conventions.
//!
//! The call number travels in `rax`, up to four arguments in `rdi`, `rsi`,
//! `rdx` and `r10`, and the result comes back in `rax`. User code enters
//! through `int 0x80`.

/// Interrupt vector reserved for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Largest error number a return value can encode.
pub const MAX_ERRNO: usize = 4095;

/// How a handler receives its arguments.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandlerKind {
    /// Four word-sized arguments.
    Args,
    /// The saved register state, for calls that replace the calling context.
    Registers,
    /// Four arguments; the handler never returns to the caller.
    NoReturn,
}

/// Whether a call serializes on the process-wide lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NeedsBigLock {
    Yes,
    No,
}

macro_rules! syscalls {
    ($($(#[$meta:meta])* $name:ident = $number:literal, $kind:ident, $lock:ident;)*) => {
        /// System call numbers, dense from zero.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        #[repr(usize)]
        pub enum Sysno {
            $($(#[$meta])* $name = $number,)*
        }

        impl Sysno {
            pub const ALL: &'static [Self] = &[$(Self::$name,)*];

            /// One past the highest call number.
            pub const COUNT: usize = Self::ALL.len();

            #[must_use]
            pub const fn from_number(number: usize) -> Option<Self> {
                match number {
                    $($number => Some(Self::$name),)*
                    _ => None,
                }
            }

            #[must_use]
            pub const fn number(self) -> usize {
                self as usize
            }

            #[must_use]
            pub const fn kind(self) -> HandlerKind {
                match self {
                    $(Self::$name => HandlerKind::$kind,)*
                }
            }

            #[must_use]
            pub const fn needs_big_lock(self) -> NeedsBigLock {
                match self {
                    $(Self::$name => NeedsBigLock::$lock,)*
                }
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }
    };
}

// `exit` and `exit_thread` never return, so they cannot hold the big lock.
syscalls! {
    Yield = 0, Args, No;
    Open = 1, Args, Yes;
    Close = 2, Args, Yes;
    Read = 3, Args, Yes;
    Write = 4, Args, Yes;
    Getpid = 5, Args, No;
    Gettid = 6, Args, No;
    /// Duplicates the caller, whose registers seed the child.
    Fork = 7, Registers, Yes;
    /// Replaces the caller's registers with the ones saved at signal delivery.
    Sigreturn = 8, Registers, Yes;
    Exit = 9, NoReturn, No;
    ExitThread = 10, NoReturn, No;
    Mmap = 11, Args, Yes;
    Munmap = 12, Args, Yes;
    Mprotect = 13, Args, Yes;
    Kill = 14, Args, Yes;
    Waitid = 15, Args, Yes;
    ClockGettime = 16, Args, No;
    ClockNanosleep = 17, Args, No;
    Futex = 18, Args, No;
    DbgPutch = 19, Args, No;
    DbgPutstr = 20, Args, No;
    Uname = 21, Args, No;
    GetRandom = 22, Args, No;
    SetThreadName = 23, Args, Yes;
}
