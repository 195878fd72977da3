//! Environments and the environment table.
//!
//! An environment is a user process: a saved register frame, an address
//! space and a lifecycle status. Identifiers carry a generation counter so a
//! stale id never reaches a recycled slot.

use alloc::vec::Vec;

use skerry_common::env::NENV;
use skerry_common::memlayout::{USTACKTOP, UTEXT};
use skerry_common::{EnvId, EnvStatus, SysError};

use crate::cpu::{CpuId, TrapContext};
use crate::cprintln;
use crate::memory::AddressSpace;
use crate::trap::CapturedFrame;
use crate::Kernel;

/// One user environment.
#[derive(Debug)]
pub struct Env {
    /// Identity.
    pub id: EnvId,
    /// Environment that created this one, `EnvId::CURRENT` for none.
    pub parent: EnvId,
    /// Lifecycle state.
    pub status: EnvStatus,
    /// Saved user registers. Authoritative whenever the environment is not
    /// executing.
    pub frame: CapturedFrame,
    /// User entry point for page fault delivery.
    pub pgfault_upcall: Option<u64>,
    /// User address space.
    pub space: AddressSpace,
    /// Number of times the environment has been run.
    pub runs: u64,
    /// CPU the environment last ran on.
    pub cpu: Option<CpuId>,
}

/// Fixed-size table of environments.
pub struct EnvTable {
    slots: Vec<Option<Env>>,
    /// Generation last handed out per slot.
    generations: Vec<u32>,
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvTable {
    /// An empty table with `NENV` slots.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NENV);
        slots.resize_with(NENV, || None);
        Self {
            slots,
            generations: alloc::vec![0; NENV],
        }
    }

    /// Creates a Runnable environment with an empty address space.
    pub fn alloc(&mut self, parent: EnvId) -> Result<EnvId, SysError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SysError::NoFreeEnv)?;
        // generation 0 would make slot 0's id collide with EnvId::CURRENT
        let generation = match self.generations[slot].wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.generations[slot] = generation;

        let id = EnvId::new(generation, slot);
        self.slots[slot] = Some(Env {
            id,
            parent,
            status: EnvStatus::Runnable,
            frame: CapturedFrame::user(UTEXT, USTACKTOP),
            pgfault_upcall: None,
            space: AddressSpace::new(),
            runs: 0,
            cpu: None,
        });
        Ok(id)
    }

    /// The environment `id`, if it still exists.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots.get(id.slot())?.as_ref().filter(|env| env.id == id)
    }

    /// Mutable access to environment `id`, if it still exists.
    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots.get_mut(id.slot())?.as_mut().filter(|env| env.id == id)
    }

    /// Removes `id` from the table.
    pub fn remove(&mut self, id: EnvId) -> Option<Env> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.as_ref().is_some_and(|env| env.id == id) {
            slot.take()
        } else {
            None
        }
    }

    /// The environment in table slot `slot`, if any.
    pub fn at_slot(&self, slot: usize) -> Option<&Env> {
        self.slots.get(slot)?.as_ref()
    }

    /// All live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().flatten()
    }

    /// Resolves an id supplied by `caller`.
    ///
    /// `EnvId::CURRENT` means the caller itself. With `checkperm` the target
    /// must be the caller or one of its immediate children.
    pub fn lookup(&self, id: EnvId, caller: EnvId, checkperm: bool) -> Result<EnvId, SysError> {
        if id.is_current() {
            return Ok(caller);
        }
        let env = self.get(id).ok_or(SysError::BadEnv)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(SysError::BadEnv);
        }
        Ok(env.id)
    }
}

/// Outcome of destroying an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destroyed {
    /// The environment was freed.
    Freed,
    /// It is running on another CPU and will be freed on its next trap.
    Deferred,
}

impl Kernel {
    /// Allocates a new environment owned by `parent`.
    pub fn env_alloc(&mut self, parent: EnvId) -> Result<EnvId, SysError> {
        let id = self.envs.alloc(parent)?;
        log::debug!("[{}] new env {}", parent, id);
        Ok(id)
    }

    /// Frees `id` and every page it maps.
    pub fn env_free(&mut self, cx: &mut TrapContext<'_>, id: EnvId) {
        let Some(mut env) = self.envs.remove(id) else {
            return;
        };
        env.space.clear(&mut self.memory);
        let by = cx.cpu.current.unwrap_or(EnvId::CURRENT);
        cprintln!(cx.machine, "[{}] free env {}", by, id);
        log::info!("[{}] free env {}", by, id);
        if cx.cpu.current == Some(id) {
            cx.cpu.current = None;
        }
    }

    /// Destroys `id`.
    ///
    /// An environment running on another CPU is only marked Dying; that CPU
    /// frees it when it next traps into the kernel.
    pub fn env_destroy(&mut self, cx: &mut TrapContext<'_>, id: EnvId) -> Destroyed {
        let elsewhere = self
            .envs
            .get(id)
            .is_some_and(|env| env.status == EnvStatus::Running && cx.cpu.current != Some(id));
        if elsewhere {
            if let Some(env) = self.envs.get_mut(id) {
                env.status = EnvStatus::Dying;
            }
            log::info!("env {} marked dying", id);
            return Destroyed::Deferred;
        }
        self.env_free(cx, id);
        Destroyed::Freed
    }
}
