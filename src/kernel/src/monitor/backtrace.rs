//! Saved-frame-pointer walking.
//!
//! Each frame record is `[saved rbp][return rip][arg0]..[arg4]`. The walk
//! stops at a null frame pointer, at the trap-time stack pointer, when a
//! word cannot be read, or after `BACKTRACE_MAX_DEPTH` frames.

use skerry_common::memlayout::WORD_SIZE;

use super::Introspect;
use crate::config::monitor::BACKTRACE_MAX_DEPTH;

/// Argument words printed per frame.
pub const NARGS: usize = 5;

/// One caller frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    /// Frame pointer of this frame.
    pub fp: u64,
    /// Return address saved in it.
    pub rip: u64,
    /// The words above the return address.
    pub args: [u64; NARGS],
}

/// Cursor over a frame-pointer chain.
#[derive(Debug, Clone)]
pub struct Backtrace {
    fp: u64,
    sentinel: Option<u64>,
    depth: usize,
}

impl Backtrace {
    /// Starts at `fp`. If `sentinel` is given, the frame at that address is
    /// the last one reported.
    pub fn new(fp: u64, sentinel: Option<u64>) -> Self {
        Self { fp, sentinel, depth: 0 }
    }

    /// Reads the next frame from `mem`.
    pub fn step<I: Introspect + ?Sized>(&mut self, mem: &I) -> Option<StackFrame> {
        if self.fp == 0 || self.depth >= BACKTRACE_MAX_DEPTH {
            return None;
        }
        let fp = self.fp;
        let rip = mem.read_word(fp.checked_add(WORD_SIZE)?)?;
        let mut args = [0u64; NARGS];
        for (i, arg) in args.iter_mut().enumerate() {
            let addr = fp.checked_add(WORD_SIZE * (2 + i as u64))?;
            *arg = mem.read_word(addr)?;
        }

        self.depth += 1;
        self.fp = if Some(fp) == self.sentinel {
            0
        } else {
            mem.read_word(fp).unwrap_or(0)
        };
        Some(StackFrame { fp, rip, args })
    }

    /// Iterates the remaining frames.
    pub fn frames<I: Introspect + ?Sized>(self, mem: &I) -> Frames<'_, I> {
        Frames { walk: self, mem }
    }
}

/// Lazy iterator over a [`Backtrace`].
pub struct Frames<'a, I: Introspect + ?Sized> {
    walk: Backtrace,
    mem: &'a I,
}

impl<I: Introspect + ?Sized> Iterator for Frames<'_, I> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        self.walk.step(self.mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{DebugInfo, KernelLayout};
    use std::collections::BTreeMap;

    struct Stack(BTreeMap<u64, u64>);

    impl Stack {
        fn frame(&mut self, fp: u64, next: u64, rip: u64) {
            self.0.insert(fp, next);
            self.0.insert(fp + 8, rip);
            for i in 0..NARGS as u64 {
                self.0.insert(fp + 16 + 8 * i, i);
            }
        }
    }

    impl Introspect for Stack {
        fn frame_pointer(&self) -> u64 {
            0
        }
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
        fn resolve(&self, _rip: u64) -> Option<DebugInfo> {
            None
        }
        fn kernel_layout(&self) -> KernelLayout {
            KernelLayout::default()
        }
    }

    #[test]
    fn test_walk_ends_at_null_frame() {
        let mut stack = Stack(BTreeMap::new());
        stack.frame(0x1000, 0x1100, 0xaaa);
        stack.frame(0x1100, 0, 0xbbb);

        let rips: Vec<u64> = Backtrace::new(0x1000, None).frames(&stack).map(|f| f.rip).collect();
        assert_eq!(rips, [0xaaa, 0xbbb]);
    }

    #[test]
    fn test_walk_ends_at_sentinel() {
        let mut stack = Stack(BTreeMap::new());
        stack.frame(0x1000, 0x1100, 0xaaa);
        stack.frame(0x1100, 0x1200, 0xbbb);
        stack.frame(0x1200, 0, 0xccc);

        let frames: Vec<StackFrame> = Backtrace::new(0x1000, Some(0x1100)).frames(&stack).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].fp, 0x1100);
        assert_eq!(frames[1].args, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cyclic_chain_is_bounded() {
        let mut stack = Stack(BTreeMap::new());
        stack.frame(0x1000, 0x1000, 0xaaa);

        assert_eq!(Backtrace::new(0x1000, None).frames(&stack).count(), BACKTRACE_MAX_DEPTH);
    }

    #[test]
    fn test_unreadable_frame_stops_walk() {
        let mut stack = Stack(BTreeMap::new());
        stack.frame(0x1000, 0xdead_0000, 0xaaa);

        assert_eq!(Backtrace::new(0x1000, None).frames(&stack).count(), 1);
    }
}
