//! Per-environment page tables.
//!
//! A software model of a two-level user page table: entries are keyed by
//! virtual page number, and a "page table" for a `PTSIZE` region exists
//! whenever at least one entry in that region does.

use alloc::collections::BTreeMap;

use skerry_common::memlayout::{page_number, page_round_down, PGSIZE, PTSIZE, UTOP};
use skerry_common::{FaultCode, PageTableEntry, PteFlags};

use super::frame::PhysMemory;

/// The user half of one environment's address space.
#[derive(Debug, Default)]
pub struct AddressSpace {
    entries: BTreeMap<u64, PageTableEntry>,
}

impl AddressSpace {
    /// An address space with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry mapping the page containing `va`.
    pub fn lookup(&self, va: u64) -> Option<PageTableEntry> {
        self.entries.get(&page_number(va)).copied()
    }

    /// Maps the page containing `va`, replacing any existing mapping.
    ///
    /// The new frame is referenced before the old one is released, so
    /// re-inserting the same frame with different permissions is safe.
    pub fn insert(&mut self, memory: &mut PhysMemory, va: u64, pte: PageTableEntry) {
        memory.incref(pte.frame());
        if let Some(old) = self.entries.insert(page_number(va), pte) {
            memory.decref(old.frame());
        }
    }

    /// Unmaps the page containing `va`. Unmapping nothing is not an error.
    pub fn remove(&mut self, memory: &mut PhysMemory, va: u64) -> Option<PageTableEntry> {
        let old = self.entries.remove(&page_number(va))?;
        memory.decref(old.frame());
        Some(old)
    }

    /// Unmaps everything.
    pub fn clear(&mut self, memory: &mut PhysMemory) {
        for (_, pte) in core::mem::take(&mut self.entries) {
            memory.decref(pte.frame());
        }
    }

    /// Whether a page table covers the `PTSIZE` region containing `va`.
    pub fn page_table_present(&self, va: u64) -> bool {
        let first = page_number(va & !(PTSIZE - 1));
        let last = first + page_number(PTSIZE);
        self.entries.range(first..last).next().is_some()
    }

    /// Mapped pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, PageTableEntry)> + '_ {
        self.entries.iter().map(|(&vpn, &pte)| (vpn * PGSIZE, pte))
    }

    /// Translates an access the way the MMU would.
    ///
    /// Returns the frame number, or the error code of the page fault the
    /// access raises.
    pub fn translate(&self, va: u64, write: bool, user: bool) -> Result<u64, FaultCode> {
        let mut code = FaultCode::empty();
        code.set(FaultCode::WRITE, write);
        code.set(FaultCode::USER, user);

        let Some(pte) = self.lookup(va).filter(|pte| pte.is_present()) else {
            return Err(code);
        };
        let flags = pte.flags();
        if (user && !flags.contains(PteFlags::USER)) || (write && !flags.contains(PteFlags::WRITABLE)) {
            return Err(code | FaultCode::PROTECTION);
        }
        Ok(pte.frame())
    }

    /// Checks that user code may access `[va, va + len)` with `perm`.
    ///
    /// On failure returns the first offending address.
    pub fn check_user(&self, va: u64, len: u64, perm: PteFlags) -> Result<(), u64> {
        let perm = perm | PteFlags::PRESENT | PteFlags::USER;
        let end = va.checked_add(len).ok_or(va)?;
        let mut page = page_round_down(va);
        while page < end {
            let ok = page < UTOP
                && self
                    .lookup(page)
                    .is_some_and(|pte| pte.flags().contains(perm));
            if !ok {
                return Err(page.max(va));
            }
            page += PGSIZE;
        }
        Ok(())
    }

    /// Copies from user memory without permission checks.
    ///
    /// Fails with the first unmapped address.
    pub fn read(&self, memory: &PhysMemory, va: u64, buf: &mut [u8]) -> Result<(), u64> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(buf.len() - done);
            let page = self
                .lookup(addr)
                .and_then(|pte| memory.page(pte.frame()))
                .ok_or(addr)?;
            buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies into user memory without permission checks.
    ///
    /// Fails with the first unmapped address.
    pub fn write(&self, memory: &mut PhysMemory, va: u64, bytes: &[u8]) -> Result<(), u64> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(bytes.len() - done);
            let pfn = self.lookup(addr).ok_or(addr)?.frame();
            let page = memory.page_mut(pfn).ok_or(addr)?;
            page[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}
