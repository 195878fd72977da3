//! System-wide error types for Skerry.

use core::fmt;

/// Errors returned by privileged operations.
///
/// On the wire a failed syscall places the negative [`SysError::code`] in the
/// accumulator register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SysError {
    /// Unspecified or unknown problem
    Unspecified,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv,
    /// Invalid parameter
    Invalid,
    /// Request failed due to memory shortage
    NoMem,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv,
    /// Memory fault
    Fault,
}

impl SysError {
    /// The negative status code carried in the accumulator register.
    pub const fn code(self) -> i32 {
        match self {
            SysError::Unspecified => -1,
            SysError::BadEnv => -2,
            SysError::Invalid => -3,
            SysError::NoMem => -4,
            SysError::NoFreeEnv => -5,
            SysError::Fault => -6,
        }
    }

    /// Decodes a negative status code. Returns `None` for non-error values.
    pub const fn from_code(code: i64) -> Option<SysError> {
        match code {
            -1 => Some(SysError::Unspecified),
            -2 => Some(SysError::BadEnv),
            -3 => Some(SysError::Invalid),
            -4 => Some(SysError::NoMem),
            -5 => Some(SysError::NoFreeEnv),
            -6 => Some(SysError::Fault),
            c if c < 0 => Some(SysError::Unspecified),
            _ => None,
        }
    }

    /// Splits a raw syscall return into a value or an error.
    pub const fn check(ret: i64) -> Result<u64, SysError> {
        match SysError::from_code(ret) {
            Some(err) => Err(err),
            None => Ok(ret as u64),
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysError::Unspecified => write!(f, "unspecified error"),
            SysError::BadEnv => write!(f, "bad environment"),
            SysError::Invalid => write!(f, "invalid parameter"),
            SysError::NoMem => write!(f, "out of memory"),
            SysError::NoFreeEnv => write!(f, "out of environments"),
            SysError::Fault => write!(f, "segmentation fault"),
        }
    }
}

/// Failure reported by a user-level page fault handler.
///
/// Any error terminates the faulting environment; the variants only change
/// what gets reported before it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The fault was not a write to a copy-on-write page.
    NotCopyOnWrite {
        /// Faulting virtual address.
        va: u64,
        /// Error code from the fault record.
        err: u64,
    },
    /// A system call made while resolving the fault failed.
    Syscall(SysError),
}

impl From<SysError> for FaultError {
    fn from(err: SysError) -> Self {
        FaultError::Syscall(err)
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::NotCopyOnWrite { va, err } => write!(
                f,
                "faulting access at {:#010x} (err {:#x}) is not a write to a copy-on-write page",
                va, err
            ),
            FaultError::Syscall(err) => write!(f, "{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_decode_back() {
        for err in [
            SysError::Unspecified,
            SysError::BadEnv,
            SysError::Invalid,
            SysError::NoMem,
            SysError::NoFreeEnv,
            SysError::Fault,
        ] {
            assert!(err.code() < 0);
            assert_eq!(SysError::from_code(err.code() as i64), Some(err));
        }
    }

    #[test]
    fn test_check_passes_values_through() {
        assert_eq!(SysError::check(0), Ok(0));
        assert_eq!(SysError::check(0x1001), Ok(0x1001));
        assert_eq!(SysError::check(-3), Err(SysError::Invalid));
        assert_eq!(SysError::check(-77), Err(SysError::Unspecified));
    }
}
