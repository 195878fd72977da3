//! System call numbers.
//!
//! The number travels in `rax`, up to five arguments in `rdx`, `rcx`, `rbx`,
//! `rdi` and `rsi`, in that order. The result comes back in `rax`.

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    /// Print a string from user memory to the console.
    Cputs = 0,
    /// Identity of the caller.
    GetEnvId = 1,
    /// Destroy an environment.
    EnvDestroy = 2,
    /// Give up the CPU.
    Yield = 3,
    /// Create a child with an empty address space.
    Exofork = 4,
    /// Change an environment's status.
    EnvSetStatus = 5,
    /// Allocate and map a zeroed page.
    PageAlloc = 6,
    /// Map a page of one environment into another.
    PageMap = 7,
    /// Remove a mapping.
    PageUnmap = 8,
    /// Register the page fault upcall entry.
    EnvSetPgfaultUpcall = 9,
}

impl Syscall {
    /// Every syscall, in numeric order.
    pub const ALL: [Syscall; 10] = [
        Syscall::Cputs,
        Syscall::GetEnvId,
        Syscall::EnvDestroy,
        Syscall::Yield,
        Syscall::Exofork,
        Syscall::EnvSetStatus,
        Syscall::PageAlloc,
        Syscall::PageMap,
        Syscall::PageUnmap,
        Syscall::EnvSetPgfaultUpcall,
    ];

    /// Raw number placed in `rax`.
    pub const fn number(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for Syscall {
    type Error = crate::error::SysError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Syscall::ALL
            .get(raw as usize)
            .copied()
            .ok_or(crate::error::SysError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_are_table_positions() {
        for (i, call) in Syscall::ALL.iter().enumerate() {
            assert_eq!(call.number(), i as u64);
            assert_eq!(Syscall::try_from(i as u64), Ok(*call));
        }
        assert!(Syscall::try_from(99).is_err());
    }
}
