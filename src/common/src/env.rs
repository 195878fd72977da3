//! Environment identifiers and lifecycle states.

use core::fmt;

/// Number of low bits of an [`EnvId`] that index the environment table.
pub const LOG2NENV: u32 = 10;
/// Maximum number of environments.
pub const NENV: usize = 1 << LOG2NENV;
/// Shift of the generation counter inside an [`EnvId`].
pub const ENVGENSHIFT: u32 = 12;

/// Identifies an environment.
///
/// The low [`LOG2NENV`] bits are the table slot, the bits above
/// [`ENVGENSHIFT`] a generation counter so that a recycled slot never
/// reuses an id. The raw value 0 names "the calling environment" in
/// syscalls and is what `fork` returns in the child.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnvId(u32);

impl EnvId {
    /// Shorthand for the calling environment.
    pub const CURRENT: EnvId = EnvId(0);

    /// Wraps a raw identifier.
    pub const fn from_raw(raw: u32) -> Self {
        EnvId(raw)
    }

    /// Builds an identifier from a generation and a table slot.
    pub const fn new(generation: u32, slot: usize) -> Self {
        EnvId((generation << ENVGENSHIFT) | (slot as u32 & (NENV as u32 - 1)))
    }

    /// The raw identifier value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Index of this environment in the environment table.
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Whether this is the "calling environment" shorthand.
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot is unused.
    Free = 0,
    /// Destroyed while running on another CPU; reclaimed on its next trap.
    Dying = 1,
    /// Waiting to be scheduled.
    Runnable = 2,
    /// Currently executing on some CPU.
    Running = 3,
    /// Exists but must not be scheduled (e.g. a freshly forked child).
    NotRunnable = 4,
}

impl TryFrom<u64> for EnvStatus {
    type Error = crate::error::SysError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(EnvStatus::Free),
            1 => Ok(EnvStatus::Dying),
            2 => Ok(EnvStatus::Runnable),
            3 => Ok(EnvStatus::Running),
            4 => Ok(EnvStatus::NotRunnable),
            _ => Err(crate::error::SysError::Invalid),
        }
    }
}
