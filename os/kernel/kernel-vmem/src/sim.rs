//! Host-side stand-ins for physical memory.
//!
//! [`SimulatedRam`] backs the temporary window with an ordinary heap buffer so
//! that page tables can be built and walked in unit tests. [`BumpAlloc`]
//! hands out its frames in order.

extern crate alloc;

use crate::{FrameAlloc, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_error::{MemError, Result};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// A run of simulated physical frames starting at physical address zero.
pub struct SimulatedRam {
    frames: Box<[UnsafeCell<Frame>]>,
}

impl SimulatedRam {
    /// Zeroed RAM of `count` frames.
    #[must_use]
    pub fn with_frames(count: usize) -> Self {
        let frames = (0..count)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.frames.len() as u64 * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn frame_ptr(&self, frame: PhysicalPage<Size4K>) -> *mut u8 {
        let index = frame.frame_number() as usize;
        assert!(
            index < self.frames.len(),
            "frame {index} outside simulated RAM of {} frames",
            self.frames.len()
        );
        self.frames[index].get().cast()
    }

    /// Copy `len` bytes starting at `pa`; must not cross a frame.
    #[must_use]
    pub fn read(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let (frame, offset) = pa.split::<Size4K>();
        let offset = offset.as_u32() as usize;
        assert!(offset + len <= PAGE_SIZE as usize);
        // SAFETY: in bounds of one frame; tests are single threaded.
        unsafe { core::slice::from_raw_parts(self.frame_ptr(frame).add(offset), len).to_vec() }
    }

    #[must_use]
    pub fn read_u8(&self, pa: PhysicalAddress) -> u8 {
        self.read(pa, 1)[0]
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let bytes = self.read(pa, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Write `data` at `pa`; must not cross a frame.
    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let (frame, offset) = pa.split::<Size4K>();
        let offset = offset.as_u32() as usize;
        assert!(offset + data.len() <= PAGE_SIZE as usize);
        // SAFETY: in bounds of one frame; tests are single threaded.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.frame_ptr(frame).add(offset), data.len());
        }
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn map_window(&self, frame: PhysicalPage<Size4K>) -> NonNull<u8> {
        let ptr = self.frame_ptr(frame);
        // SAFETY: points into a live boxed slice.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    unsafe fn unmap_window(&self) {}
}

/// Hands out frames `next..end` in order; freed frames are recorded.
#[derive(Debug)]
pub struct BumpAlloc {
    next: u32,
    end: u32,
    freed: Vec<PhysicalPage<Size4K>>,
}

impl BumpAlloc {
    #[must_use]
    pub const fn new(first_frame: u32, end_frame: u32) -> Self {
        Self {
            next: first_frame,
            end: end_frame,
            freed: Vec::new(),
        }
    }

    /// Number of frames handed out so far.
    #[must_use]
    pub const fn next_frame(&self) -> u32 {
        self.next
    }

    #[must_use]
    pub fn freed(&self) -> &[PhysicalPage<Size4K>] {
        &self.freed
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next >= self.end {
            return None;
        }
        let frame = PhysicalPage::from_frame_number(self.next);
        self.next += 1;
        Some(frame)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) -> Result<()> {
        if page.frame_number() >= self.end || self.freed.contains(&page) {
            return Err(MemError::DoubleFree);
        }
        self.freed.push(page);
        Ok(())
    }
}
