use crate::abi::MAX_ERRNO;

/// Error numbers returned to user space, negated, in `rax`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[repr(u16)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such process")]
    ESRCH = 3,
    #[error("interrupted system call")]
    EINTR = 4,
    #[error("I/O error")]
    EIO = 5,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("out of memory")]
    ENOMEM = 12,
    #[error("bad address")]
    EFAULT = 14,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("no such system call")]
    ENOSYS = 38,
}

impl Errno {
    const ALL: [Self; 11] = [
        Self::EPERM,
        Self::ESRCH,
        Self::EINTR,
        Self::EIO,
        Self::EBADF,
        Self::ECHILD,
        Self::EAGAIN,
        Self::ENOMEM,
        Self::EFAULT,
        Self::EINVAL,
        Self::ENOSYS,
    ];

    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// `-errno` as a machine word.
    #[must_use]
    pub fn as_return_value(self) -> usize {
        0usize.wrapping_sub(usize::from(self.code()))
    }

    /// Decode a return register, if it holds an error.
    #[must_use]
    pub fn from_return_value(value: usize) -> Option<Self> {
        let code = 0usize.wrapping_sub(value);
        if (1..=MAX_ERRNO).contains(&code) {
            Self::from_code(u16::try_from(code).ok()?)
        } else {
            None
        }
    }
}

/// Whether `value` lies in the error range `-MAX_ERRNO..=-1`.
#[must_use]
pub const fn is_error(value: usize) -> bool {
    value > usize::MAX - MAX_ERRNO
}

/// The word a handler result leaves in the return register.
#[must_use]
pub fn encode_result(result: Result<usize, Errno>) -> usize {
    match result {
        Ok(value) => value,
        Err(errno) => errno.as_return_value(),
    }
}
