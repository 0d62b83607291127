//! The pool of physical frames available to user pages.

use alloc::vec::Vec;

#[cfg(any(test, feature = "software-emulation"))]
use alloc::{boxed::Box, vec};

use crate::{FrameNumber, PAGE_SIZE};

/// How frame contents are reached from the kernel.
enum PhysicalMemory {
    /// Physical memory is mapped at a fixed offset in the kernel's address space.
    DirectMapped { offset: usize },
    /// Physical memory is a host buffer; frame `base + i` lives at `i * PAGE_SIZE`.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Box<[u8]>),
}

/// A contiguous range of user frames and the set of those not yet in use.
///
/// Frames are allocated LIFO; a fresh pool hands out its lowest frame first.
pub struct FramePool {
    base: FrameNumber,
    count: usize,
    free: Vec<FrameNumber>,
    memory: PhysicalMemory,
}

impl FramePool {
    /// Creates a pool over `count` frames starting at `base`, reached through
    /// the kernel's direct map.
    ///
    /// # Safety
    ///
    /// The frames must be unused by anything else for the pool's lifetime, and
    /// `direct_map_offset + address` must be a valid writable mapping of every
    /// physical address in the range.
    pub unsafe fn direct_mapped(base: FrameNumber, count: usize, direct_map_offset: usize) -> Self {
        Self::with_memory(
            base,
            count,
            PhysicalMemory::DirectMapped {
                offset: direct_map_offset,
            },
        )
    }

    /// Creates a pool of `count` frames backed by host memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(count: usize) -> Self {
        let memory = vec![0u8; count * PAGE_SIZE].into_boxed_slice();
        Self::with_memory(FrameNumber::new(0), count, PhysicalMemory::Emulated(memory))
    }

    fn with_memory(base: FrameNumber, count: usize, memory: PhysicalMemory) -> Self {
        let free = (0..count).rev().map(|i| base + i).collect();
        Self {
            base,
            count,
            free,
            memory,
        }
    }

    /// Takes a free frame out of the pool.
    pub fn allocate(&mut self) -> Option<FrameNumber> {
        self.free.pop()
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame does not belong to this pool.
    pub fn deallocate(&mut self, frame: FrameNumber) {
        assert!(self.contains(frame), "{frame:?} does not belong to this pool");
        debug_assert!(!self.free.contains(&frame), "{frame:?} freed twice");
        self.free.push(frame);
    }

    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.base && frame - self.base < self.count
    }

    /// Position of `frame` within the pool.
    pub(crate) fn index_of(&self, frame: FrameNumber) -> usize {
        assert!(self.contains(frame), "{frame:?} does not belong to this pool");
        frame - self.base
    }

    pub(crate) fn frame_at(&self, index: usize) -> FrameNumber {
        self.base + index
    }

    pub fn total_frames(&self) -> usize {
        self.count
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Contents of `frame`.
    pub fn bytes(&self, frame: FrameNumber) -> &[u8] {
        assert!(self.contains(frame), "{frame:?} does not belong to this pool");
        match &self.memory {
            PhysicalMemory::DirectMapped { offset } => {
                let ptr = (offset + frame.start().as_usize()) as *const u8;
                // SAFETY: The constructor's contract makes the whole range mapped
                // and owned by the pool.
                unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            PhysicalMemory::Emulated(memory) => {
                let index = frame - self.base;
                &memory[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
            }
        }
    }

    /// Mutable contents of `frame`.
    pub fn bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        assert!(self.contains(frame), "{frame:?} does not belong to this pool");
        match &mut self.memory {
            PhysicalMemory::DirectMapped { offset } => {
                let ptr = (*offset + frame.start().as_usize()) as *mut u8;
                // SAFETY: As for `bytes`; `&mut self` makes the access exclusive.
                unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE) }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            PhysicalMemory::Emulated(memory) => {
                let index = frame - self.base;
                &mut memory[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
            }
        }
    }
}
