//! Reference-counted pool of physical page frames.

use alloc::boxed::Box;
use alloc::vec::Vec;

use skerry_common::memlayout::PGSIZE;
use skerry_common::SysError;

/// Contents of one page.
pub type Page = [u8; PGSIZE as usize];

struct Frame {
    refs: u32,
    data: Box<Page>,
}

/// Physical memory as a fixed number of page frames.
///
/// A frame is allocated with no references and freed when its last mapping
/// goes away.
pub struct PhysMemory {
    frames: Vec<Option<Frame>>,
    capacity: usize,
}

impl PhysMemory {
    /// A pool that can hold up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            capacity,
        }
    }

    /// Allocates a zero-filled frame and returns its number.
    pub fn alloc_zeroed(&mut self) -> Result<u64, SysError> {
        let frame = Frame {
            refs: 0,
            data: Box::new([0; PGSIZE as usize]),
        };
        if let Some(pfn) = self.frames.iter().position(Option::is_none) {
            self.frames[pfn] = Some(frame);
            return Ok(pfn as u64);
        }
        if self.frames.len() >= self.capacity {
            log::warn!("frame pool exhausted ({} frames)", self.capacity);
            return Err(SysError::NoMem);
        }
        self.frames.push(Some(frame));
        Ok(self.frames.len() as u64 - 1)
    }

    /// Adds a reference to `pfn`.
    pub fn incref(&mut self, pfn: u64) {
        if let Some(frame) = self.frame_mut(pfn) {
            frame.refs += 1;
        }
    }

    /// Drops a reference to `pfn`, freeing the frame when none remain.
    pub fn decref(&mut self, pfn: u64) {
        let Some(frame) = self.frame_mut(pfn) else {
            return;
        };
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            self.frames[pfn as usize] = None;
        }
    }

    /// Number of mappings of `pfn`. Zero for a free frame.
    pub fn refcount(&self, pfn: u64) -> u32 {
        self.frame(pfn).map_or(0, |frame| frame.refs)
    }

    /// Contents of an allocated frame.
    pub fn page(&self, pfn: u64) -> Option<&Page> {
        self.frame(pfn).map(|frame| &*frame.data)
    }

    /// Mutable contents of an allocated frame.
    pub fn page_mut(&mut self, pfn: u64) -> Option<&mut Page> {
        self.frame_mut(pfn).map(|frame| &mut *frame.data)
    }

    /// Number of frames currently allocated.
    pub fn allocated(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    fn frame(&self, pfn: u64) -> Option<&Frame> {
        self.frames.get(pfn as usize)?.as_ref()
    }

    fn frame_mut(&mut self, pfn: u64) -> Option<&mut Frame> {
        self.frames.get_mut(pfn as usize)?.as_mut()
    }
}
