//! # Temporary map window
//!
//! One fixed kernel virtual page that can be pointed at any physical frame.
//! It is the only way page directories and page tables are read or written
//! once paging is on, so at most one such frame is visible at any time.

use crate::{PageDirectory, PageTable, PhysMapper};
use core::cell::Cell;
use core::ptr::NonNull;
use kernel_error::{Fatal, fatal};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// The single-frame mapping window.
///
/// Mapping while a frame is held, or unmapping while idle, is fatal.
pub struct TemporaryWindow<M> {
    mapper: M,
    held: Cell<Option<PhysicalPage<Size4K>>>,
}

/// Unmaps the window when dropped, including while unwinding.
struct Held<'w, M: PhysMapper> {
    window: &'w TemporaryWindow<M>,
}

impl<M: PhysMapper> Drop for Held<'_, M> {
    fn drop(&mut self) {
        self.window.unmap();
    }
}

impl<M: PhysMapper> TemporaryWindow<M> {
    #[inline]
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            held: Cell::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.held.get().is_some()
    }

    /// The frame currently behind the window, if any.
    #[inline]
    #[must_use]
    pub fn mapped_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.held.get()
    }

    /// Point the window at `frame`.
    ///
    /// The returned pointer stays valid until [`unmap`](Self::unmap).
    /// Prefer the scoped `with_*` helpers.
    #[track_caller]
    pub fn map(&self, frame: PhysicalPage<Size4K>) -> NonNull<u8> {
        if self.held.get().is_some() {
            fatal(Fatal::TemporaryMapBusy);
        }
        self.held.set(Some(frame));
        // SAFETY: the window was idle, so no other pointer into it is live.
        unsafe { self.mapper.map_window(frame) }
    }

    /// Detach the window.
    #[track_caller]
    pub fn unmap(&self) {
        if self.held.take().is_none() {
            fatal(Fatal::TemporaryMapIdle);
        }
        // SAFETY: the pointer handed out by `map` is dead by contract.
        unsafe { self.mapper.unmap_window() }
    }

    /// Run `f` with `frame` visible as a typed page.
    ///
    /// # Safety
    /// `T` must be valid for any bit pattern and no larger than a page.
    #[track_caller]
    unsafe fn with_frame<T, R>(&self, frame: PhysicalPage<Size4K>, f: impl FnOnce(&mut T) -> R) -> R {
        const { assert!(size_of::<T>() <= PAGE_SIZE as usize) };
        const { assert!(align_of::<T>() <= PAGE_SIZE as usize) };

        let ptr = self.map(frame);
        let _held = Held { window: self };
        // SAFETY: the window is page aligned and exclusively ours until `_held` drops.
        let page = unsafe { ptr.cast::<T>().as_mut() };
        f(page)
    }

    /// Run `f` over the raw bytes of `frame`.
    #[track_caller]
    pub fn with_bytes<R>(
        &self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut [u8; PAGE_SIZE as usize]) -> R,
    ) -> R {
        // SAFETY: any byte pattern is a valid byte array.
        unsafe { self.with_frame(frame, f) }
    }

    /// Run `f` with `frame` viewed as a page directory.
    #[track_caller]
    pub fn with_directory<R>(
        &self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut PageDirectory) -> R,
    ) -> R {
        // SAFETY: entries are plain `u32` bitfields.
        unsafe { self.with_frame(frame, f) }
    }

    /// Run `f` with `frame` viewed as a page table.
    #[track_caller]
    pub fn with_table<R>(&self, frame: PhysicalPage<Size4K>, f: impl FnOnce(&mut PageTable) -> R) -> R {
        // SAFETY: entries are plain `u32` bitfields.
        unsafe { self.with_frame(frame, f) }
    }

    /// Fill `frame` with zeroes.
    pub fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        self.with_bytes(frame, |bytes| bytes.fill(0));
    }

    /// Copy `src` into `frame` starting at byte `offset`.
    ///
    /// Returns the number of bytes copied, which is less than `src.len()` when
    /// the data runs past the end of the frame.
    pub fn copy_into(&self, frame: PhysicalPage<Size4K>, offset: usize, src: &[u8]) -> usize {
        self.with_bytes(frame, |bytes| {
            let Some(dst) = bytes.get_mut(offset..) else {
                return 0;
            };
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            n
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRam;

    fn frame(n: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(n)
    }

    #[test]
    fn scoped_access_unmaps() {
        let ram = SimulatedRam::with_frames(4);
        let window = TemporaryWindow::new(&ram);
        window.with_bytes(frame(2), |b| b[7] = 0xAB);
        assert!(!window.is_mapped());
        assert_eq!(ram.read_u8(frame(2).base() + 7), 0xAB);
    }

    #[test]
    fn copy_into_stops_at_frame_end() {
        let ram = SimulatedRam::with_frames(2);
        let window = TemporaryWindow::new(&ram);
        assert_eq!(window.copy_into(frame(1), 4094, &[1, 2, 3, 4]), 2);
        assert_eq!(window.copy_into(frame(1), 5000, &[1]), 0);
        assert_eq!(ram.read_u8(frame(1).base() + 4095), 2);
    }

    #[test]
    #[should_panic(expected = "temporary map window already in use")]
    fn nested_map_is_fatal() {
        let ram = SimulatedRam::with_frames(4);
        let window = TemporaryWindow::new(&ram);
        window.with_table(frame(1), |_| {
            window.zero_frame(frame(2));
        });
    }

    #[test]
    #[should_panic(expected = "temporary map window not in use")]
    fn unmap_idle_is_fatal() {
        let ram = SimulatedRam::with_frames(1);
        let window = TemporaryWindow::new(&ram);
        window.unmap();
    }

    #[test]
    fn manual_map_reports_frame() {
        let ram = SimulatedRam::with_frames(4);
        let window = TemporaryWindow::new(&ram);
        let _ = window.map(frame(3));
        assert_eq!(window.mapped_frame(), Some(frame(3)));
        window.unmap();
        assert_eq!(window.mapped_frame(), None);
    }
}
