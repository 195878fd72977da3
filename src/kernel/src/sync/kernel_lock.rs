//! The big kernel lock.
//!
//! One lock serializes all kernel-mode execution that starts from a user
//! trap. A CPU takes it before touching shared kernel or environment state
//! and gives it up only when it returns to an environment or goes idle.
//! Because the release happens on a different code path than the acquire
//! (the trap entry takes it, `env_run` or the idle path drops it), this is
//! an explicit acquire/release lock that remembers its holder rather than a
//! guard-based mutex.

use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::cpu::CpuId;

const NO_HOLDER: u8 = u8::MAX;

/// Errors from misuse of the lock protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The CPU tried to take the lock it already holds.
    AlreadyHeld(CpuId),
    /// The CPU tried to release a lock it does not hold.
    NotHeld(CpuId),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyHeld(cpu) => write!(f, "kernel lock: CPU {} already holds it", cpu),
            LockError::NotHeld(cpu) => write!(f, "kernel lock: CPU {} releases without holding", cpu),
        }
    }
}

/// Spinning lock that records which CPU holds it.
pub struct BigKernelLock {
    /// Lock state: false = unlocked, true = locked.
    locked: AtomicBool,
    /// Holding CPU, or `NO_HOLDER`.
    holder: AtomicU8,
}

impl Default for BigKernelLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BigKernelLock {
    /// Create a new unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU8::new(NO_HOLDER),
        }
    }

    /// Attempt to acquire the lock without spinning.
    pub fn try_acquire(&self, cpu: CpuId) -> Result<bool, LockError> {
        if self.holding(cpu) {
            return Err(LockError::AlreadyHeld(cpu));
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.holder.store(cpu.as_u8(), Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Spin until the lock is acquired by `cpu`.
    pub fn acquire(&self, cpu: CpuId) -> Result<(), LockError> {
        loop {
            if self.try_acquire(cpu)? {
                log::trace!("kernel lock acquired by CPU {}", cpu);
                return Ok(());
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Release the lock held by `cpu`.
    pub fn release(&self, cpu: CpuId) -> Result<(), LockError> {
        if !self.holding(cpu) {
            return Err(LockError::NotHeld(cpu));
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        log::trace!("kernel lock released by CPU {}", cpu);
        Ok(())
    }

    /// Whether `cpu` currently holds the lock.
    pub fn holding(&self, cpu: CpuId) -> bool {
        self.locked.load(Ordering::Acquire) && self.holder.load(Ordering::Relaxed) == cpu.as_u8()
    }

    /// Whether any CPU holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_uncontended() {
        let lock = BigKernelLock::new();
        let cpu = CpuId::new(0);

        lock.acquire(cpu).expect("should acquire lock");
        assert!(lock.holding(cpu));
        lock.release(cpu).expect("should release lock");
        assert!(!lock.is_locked());

        // Should be able to lock again
        lock.acquire(cpu).expect("should acquire lock again");
        assert!(lock.holding(cpu));
    }

    #[test]
    fn test_try_acquire_fails_when_held_elsewhere() {
        let lock = BigKernelLock::new();
        lock.acquire(CpuId::new(0)).unwrap();

        assert_eq!(lock.try_acquire(CpuId::new(1)), Ok(false));
        assert!(!lock.holding(CpuId::new(1)));
    }

    #[test]
    fn test_protocol_misuse_is_reported() {
        let lock = BigKernelLock::new();
        let cpu = CpuId::new(2);

        assert_eq!(lock.release(cpu), Err(LockError::NotHeld(cpu)));
        lock.acquire(cpu).unwrap();
        assert_eq!(lock.acquire(cpu), Err(LockError::AlreadyHeld(cpu)));
        assert_eq!(lock.release(CpuId::new(3)), Err(LockError::NotHeld(CpuId::new(3))));
    }
}
