//! Virtual memory layout shared by kernel and user space.
//!
//! ```text
//!  KERNBASE, KSTACKTOP --> +------------------------------+
//!                          |   CPU0's kernel stack        | KSTKSIZE
//!                          | - - - - - - - - - - - - - - -|
//!                          |   invalid memory (guard)     | KSTKGAP
//!                          +------------------------------+
//!                          |   CPU1's kernel stack        |
//!                          :              .               :
//!
//!  UTOP, UXSTACKTOP -----> +------------------------------+
//!                          |   user exception stack       | PGSIZE
//!                          +------------------------------+ UXSTACKTOP - PGSIZE
//!                          |   empty (guard)              | PGSIZE
//!  USTACKTOP ------------> +------------------------------+
//!                          |   normal user stack          |
//!                          :              .               :
//!  UTEXT ----------------> +------------------------------+
//!  PFTEMP ---------------> |   page-fault scratch page    |
//!  UTEMP ----------------> +------------------------------+
//! ```

/// Bytes per page.
pub const PGSIZE: u64 = 4096;
/// Bits of the page offset.
pub const PGSHIFT: u32 = 12;
/// Page table entries per page table.
pub const NPTENTRIES: u64 = 512;
/// Bytes mapped by one page table.
pub const PTSIZE: u64 = PGSIZE * NPTENTRIES;
/// Bytes per machine word.
pub const WORD_SIZE: u64 = 8;

/// Start of the kernel's half of the address space.
pub const KERNBASE: u64 = 0xFFFF_FFFF_8000_0000;
/// Top of CPU 0's kernel stack.
pub const KSTACKTOP: u64 = KERNBASE;
/// Size of one per-CPU kernel stack.
pub const KSTKSIZE: u64 = 8 * PGSIZE;
/// Unmapped guard between adjacent kernel stacks.
pub const KSTKGAP: u64 = 8 * PGSIZE;

/// Highest user-accessible address (exclusive).
pub const UTOP: u64 = 0xEEC0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u64 = UTOP;
/// Top of the normal user stack, one guard page below the exception stack.
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE;
/// Where user programs are linked.
pub const UTEXT: u64 = 2 * PTSIZE;
/// Scratch region for temporary user mappings.
pub const UTEMP: u64 = PTSIZE;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u64 = UTEMP + PTSIZE - PGSIZE;
/// Entry of the page fault upcall trampoline, linked right after the user
/// program's start stub.
pub const PGFAULT_UPCALL: u64 = UTEXT + 0x20;

/// Rounds `addr` down to its page boundary.
pub const fn page_round_down(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
pub const fn page_round_up(addr: u64) -> u64 {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// Virtual page number of `addr`.
pub const fn page_number(addr: u64) -> u64 {
    addr >> PGSHIFT
}

/// Whether `addr` lies on a page boundary.
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PGSIZE - 1) == 0
}

/// Whether `addr` lies inside the user exception stack.
pub const fn in_exception_stack(addr: u64) -> bool {
    addr >= UXSTACKTOP - PGSIZE && addr < UXSTACKTOP
}
