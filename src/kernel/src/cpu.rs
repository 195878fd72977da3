//! Per-CPU state and the context passed through every trap.

use core::fmt;

use skerry_common::EnvId;

use crate::trap::{CapturedFrame, PerCpuContext};
use crate::Machine;

/// Index of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u8);

impl CpuId {
    /// Wraps a processor index.
    pub const fn new(id: u8) -> Self {
        CpuId(id)
    }

    /// The raw index.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// The index as a table offset.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    /// Not brought up.
    Unused,
    /// Running kernel or user code.
    Started,
    /// Idle in the scheduler with the kernel lock released.
    Halted,
}

/// Everything the kernel tracks about one processor.
#[derive(Debug)]
pub struct CpuState {
    id: CpuId,
    /// Scheduling state.
    pub status: CpuStatus,
    /// Environment this CPU is running, if any.
    pub current: Option<EnvId>,
    /// Most recent frame the dispatcher saw, for diagnostics.
    pub last_frame: Option<CapturedFrame>,
    /// Task state and kernel stack, once initialized.
    pub context: Option<PerCpuContext>,
}

impl CpuState {
    /// State of a processor that has not been brought up.
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            status: CpuStatus::Unused,
            current: None,
            last_frame: None,
            context: None,
        }
    }

    /// This processor's index.
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Sets the status and returns the previous one.
    pub fn swap_status(&mut self, status: CpuStatus) -> CpuStatus {
        core::mem::replace(&mut self.status, status)
    }
}

/// The explicit context of one trap: which CPU took it and the machine to
/// talk to.
pub struct TrapContext<'a> {
    /// The CPU handling the trap.
    pub cpu: &'a mut CpuState,
    /// Hardware collaborators.
    pub machine: &'a mut dyn Machine,
}

impl<'a> TrapContext<'a> {
    /// Bundles a CPU with its machine.
    pub fn new(cpu: &'a mut CpuState, machine: &'a mut dyn Machine) -> Self {
        Self { cpu, machine }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_status_returns_previous() {
        let mut cpu = CpuState::new(CpuId::new(1));
        assert_eq!(cpu.swap_status(CpuStatus::Halted), CpuStatus::Unused);
        assert_eq!(cpu.swap_status(CpuStatus::Started), CpuStatus::Halted);
        assert_eq!(cpu.status, CpuStatus::Started);
        assert_eq!(cpu.id().index(), 1);
    }
}
