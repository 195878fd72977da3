//! Trap numbers, the general register block and the user fault record.

use bitflags::bitflags;

use crate::memlayout::WORD_SIZE;

// Processor-defined exceptions.
/// Divide error.
pub const T_DIVIDE: u8 = 0;
/// Debug exception (single step).
pub const T_DEBUG: u8 = 1;
/// Non-maskable interrupt.
pub const T_NMI: u8 = 2;
/// Breakpoint.
pub const T_BRKPT: u8 = 3;
/// Overflow.
pub const T_OFLOW: u8 = 4;
/// Bounds check.
pub const T_BOUND: u8 = 5;
/// Illegal opcode.
pub const T_ILLOP: u8 = 6;
/// Device not available.
pub const T_DEVICE: u8 = 7;
/// Double fault.
pub const T_DBLFLT: u8 = 8;
/// Invalid task switch segment.
pub const T_TSS: u8 = 10;
/// Segment not present.
pub const T_SEGNP: u8 = 11;
/// Stack exception.
pub const T_STACK: u8 = 12;
/// General protection fault.
pub const T_GPFLT: u8 = 13;
/// Page fault.
pub const T_PGFLT: u8 = 14;
/// Floating point error.
pub const T_FPERR: u8 = 16;
/// Alignment check.
pub const T_ALIGN: u8 = 17;
/// Machine check.
pub const T_MCHK: u8 = 18;
/// SIMD floating point error.
pub const T_SIMDERR: u8 = 19;

/// System call vector.
pub const T_SYSCALL: u8 = 48;

/// Vector of hardware IRQ 0.
pub const IRQ_OFFSET: u8 = 32;
/// Number of hardware IRQ lines.
pub const NIRQS: u8 = 16;

// Hardware IRQ numbers, relative to IRQ_OFFSET.
/// Timer.
pub const IRQ_TIMER: u8 = 0;
/// PS/2 keyboard.
pub const IRQ_KBD: u8 = 1;
/// COM1 serial port.
pub const IRQ_SERIAL: u8 = 4;
/// Spurious interrupts from the interrupt controller.
pub const IRQ_SPURIOUS: u8 = 7;

/// Whether the processor pushes an error code for `vector`.
pub const fn has_error_code(vector: u8) -> bool {
    matches!(
        vector,
        T_DBLFLT | T_TSS | T_SEGNP | T_STACK | T_GPFLT | T_PGFLT | T_ALIGN
    )
}

bitflags! {
    /// Page fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FaultCode: u64 {
        /// Protection violation; clear means the page was not present.
        const PROTECTION = 1 << 0;
        /// Caused by a write; clear means a read.
        const WRITE      = 1 << 1;
        /// Occurred in user mode.
        const USER       = 1 << 2;
    }
}

/// General purpose registers in the order the trap entry code pushes them
/// (the last register pushed comes first).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PushRegs {
    /// Register r15.
    pub r15: u64,
    /// Register r14.
    pub r14: u64,
    /// Register r13.
    pub r13: u64,
    /// Register r12.
    pub r12: u64,
    /// Register r11.
    pub r11: u64,
    /// Register r10.
    pub r10: u64,
    /// Register r9.
    pub r9: u64,
    /// Register r8.
    pub r8: u64,
    /// Fourth syscall argument.
    pub rdi: u64,
    /// Fifth syscall argument.
    pub rsi: u64,
    /// Frame pointer.
    pub rbp: u64,
    /// Third syscall argument.
    pub rbx: u64,
    /// First syscall argument.
    pub rdx: u64,
    /// Second syscall argument.
    pub rcx: u64,
    /// Accumulator. Syscall number on entry, result on return.
    pub rax: u64,
}

impl PushRegs {
    /// Number of registers in the block.
    pub const COUNT: usize = 15;

    /// Registers as words, in memory order.
    pub const fn to_words(&self) -> [u64; PushRegs::COUNT] {
        [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rdi, self.rsi, self.rbp, self.rbx, self.rdx, self.rcx, self.rax,
        ]
    }

    /// Inverse of [`PushRegs::to_words`].
    pub const fn from_words(w: [u64; PushRegs::COUNT]) -> Self {
        PushRegs {
            r15: w[0],
            r14: w[1],
            r13: w[2],
            r12: w[3],
            r11: w[4],
            r10: w[5],
            r9: w[6],
            r8: w[7],
            rdi: w[8],
            rsi: w[9],
            rbp: w[10],
            rbx: w[11],
            rdx: w[12],
            rcx: w[13],
            rax: w[14],
        }
    }
}

/// Record the kernel writes onto the user exception stack when it hands a
/// page fault to a user handler.
///
/// Field order is the wire layout: fault address, error code, registers,
/// flags, instruction pointer, stack pointer. `rip` and `rsp` are the
/// trap-time values the handler's return path restores.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserFaultRecord {
    /// Faulting virtual address.
    pub fault_va: u64,
    /// Error code word.
    pub err: u64,
    /// Trap-time general registers.
    pub regs: PushRegs,
    /// Trap-time flags register.
    pub rflags: u64,
    /// Trap-time instruction pointer.
    pub rip: u64,
    /// Trap-time stack pointer.
    pub rsp: u64,
}

impl UserFaultRecord {
    /// Size of the record in machine words.
    pub const WORDS: usize = PushRegs::COUNT + 5;
    /// Size of the record in bytes.
    pub const SIZE: u64 = Self::WORDS as u64 * WORD_SIZE;

    /// Encodes the record in its in-memory layout.
    pub fn to_bytes(&self) -> [u8; UserFaultRecord::SIZE as usize] {
        let mut words = [0u64; UserFaultRecord::WORDS];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..2 + PushRegs::COUNT].copy_from_slice(&self.regs.to_words());
        words[Self::WORDS - 3] = self.rflags;
        words[Self::WORDS - 2] = self.rip;
        words[Self::WORDS - 1] = self.rsp;

        let mut out = [0u8; UserFaultRecord::SIZE as usize];
        for (chunk, word) in out.chunks_exact_mut(WORD_SIZE as usize).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decodes a record from memory. `None` if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE as usize {
            return None;
        }
        let mut words = [0u64; UserFaultRecord::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD_SIZE as usize)) {
            let mut raw = [0u8; WORD_SIZE as usize];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        let mut regs = [0u64; PushRegs::COUNT];
        regs.copy_from_slice(&words[2..2 + PushRegs::COUNT]);
        Some(UserFaultRecord {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(regs),
            rflags: words[Self::WORDS - 3],
            rip: words[Self::WORDS - 2],
            rsp: words[Self::WORDS - 1],
        })
    }

    /// Error code bits.
    pub fn fault_code(&self) -> FaultCode {
        FaultCode::from_bits_truncate(self.err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_matches_repr_c_layout() {
        assert_eq!(
            UserFaultRecord::SIZE as usize,
            core::mem::size_of::<UserFaultRecord>()
        );
    }

    #[test]
    fn test_record_field_offsets() {
        let record = UserFaultRecord {
            fault_va: 0xdead_b000,
            err: 14,
            regs: PushRegs {
                rax: 0xaa,
                r15: 0x15,
                ..PushRegs::default()
            },
            rflags: 0x202,
            rip: 0x80_0020,
            rsp: 0xeebf_dff0,
        };
        let bytes = record.to_bytes();
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(word(0), 0xdead_b000);
        assert_eq!(word(1), 14);
        assert_eq!(word(2), 0x15);
        assert_eq!(word(16), 0xaa);
        assert_eq!(word(17), 0x202);
        assert_eq!(word(18), 0x80_0020);
        assert_eq!(word(19), 0xeebf_dff0);
        assert_eq!(UserFaultRecord::from_bytes(&bytes), Some(record));
        assert_eq!(UserFaultRecord::from_bytes(&bytes[..8]), None);
    }

    #[test]
    fn test_error_code_vectors() {
        assert!(has_error_code(T_PGFLT));
        assert!(has_error_code(T_GPFLT));
        assert!(!has_error_code(T_BRKPT));
        assert!(!has_error_code(T_SYSCALL));
    }
}
