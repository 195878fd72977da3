//! System call wrappers.

use skerry_common::runtime::UserRuntime;
use skerry_common::syscall::Syscall;
use skerry_common::{EnvId, EnvStatus, PteFlags, SysError};

fn call(rt: &mut dyn UserRuntime, call: Syscall, args: [u64; 5]) -> Result<u64, SysError> {
    SysError::check(rt.syscall(call, args))
}

fn raw(id: EnvId) -> u64 {
    u64::from(id.as_raw())
}

/// Prints `len` bytes at `va` on the console.
pub fn cputs(rt: &mut dyn UserRuntime, va: u64, len: u64) -> Result<(), SysError> {
    call(rt, Syscall::Cputs, [va, len, 0, 0, 0]).map(drop)
}

/// The caller's identity.
pub fn getenvid(rt: &mut dyn UserRuntime) -> Result<EnvId, SysError> {
    call(rt, Syscall::GetEnvId, [0; 5]).map(|id| EnvId::from_raw(id as u32))
}

/// Destroys `id`, which may be the caller.
pub fn env_destroy(rt: &mut dyn UserRuntime, id: EnvId) -> Result<(), SysError> {
    call(rt, Syscall::EnvDestroy, [raw(id), 0, 0, 0, 0]).map(drop)
}

/// Gives up the CPU.
pub fn yield_now(rt: &mut dyn UserRuntime) {
    // yield cannot fail
    let _ = call(rt, Syscall::Yield, [0; 5]);
}

/// Creates a child with an empty address space. Returns the child in the
/// parent and [`EnvId::CURRENT`] in the child.
pub fn exofork(rt: &mut dyn UserRuntime) -> Result<EnvId, SysError> {
    call(rt, Syscall::Exofork, [0; 5]).map(|id| EnvId::from_raw(id as u32))
}

/// Sets `id`'s status to Runnable or NotRunnable.
pub fn env_set_status(rt: &mut dyn UserRuntime, id: EnvId, status: EnvStatus) -> Result<(), SysError> {
    call(rt, Syscall::EnvSetStatus, [raw(id), status as u64, 0, 0, 0]).map(drop)
}

/// Maps a zeroed page at `va` in `id`.
pub fn page_alloc(rt: &mut dyn UserRuntime, id: EnvId, va: u64, perm: PteFlags) -> Result<(), SysError> {
    call(rt, Syscall::PageAlloc, [raw(id), va, perm.bits(), 0, 0]).map(drop)
}

/// Maps `src`'s page at `srcva` into `dst` at `dstva`.
pub fn page_map(
    rt: &mut dyn UserRuntime,
    src: EnvId,
    srcva: u64,
    dst: EnvId,
    dstva: u64,
    perm: PteFlags,
) -> Result<(), SysError> {
    call(rt, Syscall::PageMap, [raw(src), srcva, raw(dst), dstva, perm.bits()]).map(drop)
}

/// Removes the mapping at `va` in `id`.
pub fn page_unmap(rt: &mut dyn UserRuntime, id: EnvId, va: u64) -> Result<(), SysError> {
    call(rt, Syscall::PageUnmap, [raw(id), va, 0, 0, 0]).map(drop)
}

/// Registers `entry` as `id`'s page fault upcall.
pub fn env_set_pgfault_upcall(rt: &mut dyn UserRuntime, id: EnvId, entry: u64) -> Result<(), SysError> {
    call(rt, Syscall::EnvSetPgfaultUpcall, [raw(id), entry, 0, 0, 0]).map(drop)
}
