//! Per-CPU trap nesting.
//!
//! A CPU that takes a trap while it is already handling one has faulted
//! inside the kernel. That is detected per CPU, so a CPU that only finds
//! the kernel busy on another CPU waits instead.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::cpu::NCPU;
use crate::cpu::CpuId;

/// Why a CPU may not enter the trap path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestingError {
    /// The CPU is already inside the trap path.
    Recursive(CpuId),
    /// No such CPU.
    UnknownCpu(CpuId),
}

/// One "inside the trap path" flag per CPU.
pub struct TrapNesting {
    active: [AtomicBool; NCPU],
}

impl Default for TrapNesting {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapNesting {
    /// No CPU inside the trap path.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const IDLE: AtomicBool = AtomicBool::new(false);
        Self { active: [IDLE; NCPU] }
    }

    /// Marks `cpu` as inside the trap path until the guard is dropped.
    pub fn enter(&self, cpu: CpuId) -> Result<NestingGuard<'_>, NestingError> {
        let flag = self.active.get(cpu.index()).ok_or(NestingError::UnknownCpu(cpu))?;
        if flag.swap(true, Ordering::Acquire) {
            return Err(NestingError::Recursive(cpu));
        }
        Ok(NestingGuard { flag })
    }

    /// Whether `cpu` is inside the trap path.
    pub fn is_active(&self, cpu: CpuId) -> bool {
        self.active
            .get(cpu.index())
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// Clears the CPU's flag on drop.
pub struct NestingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_cpus_enter_concurrently() {
        let nesting = TrapNesting::new();
        let _a = nesting.enter(CpuId::new(0)).expect("CPU 0 enters");
        let _b = nesting.enter(CpuId::new(1)).expect("CPU 1 enters while CPU 0 is inside");
        assert!(nesting.is_active(CpuId::new(0)));
        assert!(nesting.is_active(CpuId::new(1)));
    }

    #[test]
    fn test_same_cpu_reentry_is_recursive() {
        let nesting = TrapNesting::new();
        let cpu = CpuId::new(3);
        let guard = nesting.enter(cpu).unwrap();
        assert_eq!(nesting.enter(cpu).err(), Some(NestingError::Recursive(cpu)));

        drop(guard);
        assert!(!nesting.is_active(cpu));
        assert!(nesting.enter(cpu).is_ok());
    }

    #[test]
    fn test_unknown_cpu() {
        let nesting = TrapNesting::new();
        let cpu = CpuId::new(NCPU as u8);
        assert_eq!(nesting.enter(cpu).err(), Some(NestingError::UnknownCpu(cpu)));
    }
}
