//! Page table entries and the copy-on-write page state.
//!
//! The hardware only knows present/writable/user bits. Sharing and
//! copy-on-write are recorded in the bits the architecture leaves to
//! software; [`PageState`] is the typed view of that encoding and
//! [`PageTableEntry`] the only way to build an entry, so an entry can never
//! be writable and copy-on-write at the same time.

use bitflags::bitflags;

use crate::error::SysError;
use crate::memlayout::PGSHIFT;

bitflags! {
    /// Permission bits of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PteFlags: u64 {
        /// Mapping is valid.
        const PRESENT   = 1 << 0;
        /// Mapping may be written.
        const WRITABLE  = 1 << 1;
        /// Mapping is reachable from user mode.
        const USER      = 1 << 2;
        /// Page is shared directly with other environments across fork.
        const SHARE     = 1 << 10;
        /// Page is shared copy-on-write.
        const COW       = 1 << 11;
    }
}

impl PteFlags {
    /// Bits reserved for software use.
    pub const AVAIL: PteFlags = PteFlags::SHARE.union(PteFlags::COW);
    /// Bits user space may pass to the page mapping syscalls.
    pub const SYSCALL: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER)
        .union(PteFlags::AVAIL);

    /// Checks a permission set supplied by user space.
    ///
    /// It must be present and user-accessible, use no bits outside
    /// [`PteFlags::SYSCALL`], and never combine writable with copy-on-write.
    pub fn validate_user(raw: u64) -> Result<PteFlags, SysError> {
        let flags = PteFlags::from_bits(raw).ok_or(SysError::Invalid)?;
        if !PteFlags::SYSCALL.contains(flags)
            || !flags.contains(PteFlags::PRESENT | PteFlags::USER)
            || flags.contains(PteFlags::WRITABLE | PteFlags::COW)
        {
            return Err(SysError::Invalid);
        }
        Ok(flags)
    }
}

/// Whether a mapping may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// Logical sharing state of a present user page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PageState {
    /// Owned by this environment alone.
    Private(Access),
    /// Mapped into several environments which all see each other's writes.
    SharedDirect(Access),
    /// Shared until the first write, then privatized. Never writable.
    CopyOnWrite,
}

impl PageState {
    /// Permission bits encoding this state for a user mapping.
    pub const fn flags(self) -> PteFlags {
        let base = PteFlags::PRESENT.union(PteFlags::USER);
        match self {
            PageState::Private(Access::ReadOnly) => base,
            PageState::Private(Access::ReadWrite) => base.union(PteFlags::WRITABLE),
            PageState::SharedDirect(Access::ReadOnly) => base.union(PteFlags::SHARE),
            PageState::SharedDirect(Access::ReadWrite) => {
                base.union(PteFlags::SHARE).union(PteFlags::WRITABLE)
            }
            PageState::CopyOnWrite => base.union(PteFlags::COW),
        }
    }

    /// Decodes the state from permission bits. `None` if not present.
    pub fn from_flags(flags: PteFlags) -> Option<PageState> {
        if !flags.contains(PteFlags::PRESENT) {
            return None;
        }
        let access = if flags.contains(PteFlags::WRITABLE) {
            Access::ReadWrite
        } else {
            Access::ReadOnly
        };
        if flags.contains(PteFlags::SHARE) {
            Some(PageState::SharedDirect(access))
        } else if flags.contains(PteFlags::COW) {
            Some(PageState::CopyOnWrite)
        } else {
            Some(PageState::Private(access))
        }
    }

    /// Whether a mapping in this state may be written.
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            PageState::Private(Access::ReadWrite) | PageState::SharedDirect(Access::ReadWrite)
        )
    }
}

/// A user page table entry: a frame number plus permission bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageTableEntry(u64);

const FLAG_MASK: u64 = (1 << PGSHIFT) - 1;

impl PageTableEntry {
    /// Builds an entry mapping `frame` in the given state.
    pub const fn new(frame: u64, state: PageState) -> Self {
        PageTableEntry((frame << PGSHIFT) | state.flags().bits())
    }

    /// Builds an entry from validated permission bits.
    pub fn with_flags(frame: u64, flags: PteFlags) -> Result<Self, SysError> {
        if flags.contains(PteFlags::WRITABLE | PteFlags::COW) {
            return Err(SysError::Invalid);
        }
        Ok(PageTableEntry((frame << PGSHIFT) | flags.bits()))
    }

    /// Raw entry value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Physical frame number.
    pub const fn frame(self) -> u64 {
        self.0 >> PGSHIFT
    }

    /// Permission bits.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    /// Whether the entry maps a page.
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Sharing state. `None` for a non-present entry.
    pub fn state(self) -> Option<PageState> {
        PageState::from_flags(self.flags())
    }

    /// Whether the entry is in the copy-on-write state.
    pub fn is_copy_on_write(self) -> bool {
        self.state() == Some(PageState::CopyOnWrite)
    }

    /// Same frame, demoted to copy-on-write. Drops write permission.
    pub const fn into_copy_on_write(self) -> Self {
        PageTableEntry::new(self.frame(), PageState::CopyOnWrite)
    }

    /// Entry for a freshly copied private page replacing this one.
    pub const fn privatized(self, frame: u64) -> Self {
        PageTableEntry::new(frame, PageState::Private(Access::ReadWrite))
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}
