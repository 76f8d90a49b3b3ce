//! # Physical Frame Allocator
//!
//! Tracks every 4 KiB frame of one or more physical regions in a page
//! allocation bitmap (PAB) and hands out runs of consecutive frames.
//!
//! Frames have one of four states, two bits each in the production layout:
//!
//! | State      | Value | Meaning                                   |
//! |------------|-------|-------------------------------------------|
//! | `FREE`     | 0     | may be allocated                          |
//! | `USED`     | 1     | handed out                                |
//! | `RESERVED` | 2     | firmware, kernel image, boot files        |
//! | `INVALID`  | 3     | never usable                              |
//!
//! A one-bit PAB only distinguishes free from used; reserved frames are then
//! recorded as used and the guard remembers them as reserved runs.
//!
//! The bitmap's transition guard enforces the invariants: physical frame 0
//! and frames past the usable limit are never touched, reserved and invalid
//! frames never change, and double allocation or double free stops the
//! kernel.

use core::fmt;
use core::ops::Range;
use kernel_bitmap::{Bitmap, TransitionGuard};
use kernel_error::{Fatal, MemError, Result, fatal};
use kernel_info::boot::BootInfo;
use kernel_info::memory::{DMA_LIMIT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;

pub const FREE: u8 = 0;
pub const USED: u8 = 1;
pub const RESERVED: u8 = 2;
pub const INVALID: u8 = 3;

/// Maximum number of regions one allocator manages.
pub const MAX_REGIONS: usize = 2;

/// Reserved runs a one-bit PAB region can remember.
pub const RESERVED_RUNS: usize = 32;

const FRAME: u64 = PAGE_SIZE as u64;

/// Which physical memory a request may be served from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// Anywhere.
    Any,
    /// Below [`DMA_LIMIT`], reachable by ISA DMA.
    Dma,
    /// At or above [`DMA_LIMIT`].
    NonDma,
}

impl RegionKind {
    /// Physical address range this kind stands for.
    const fn bounds(self) -> Range<u64> {
        match self {
            Self::Any => 0..u64::MAX,
            Self::Dma => 0..DMA_LIMIT as u64,
            Self::NonDma => DMA_LIMIT as u64..u64::MAX,
        }
    }
}

/// Allocator lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PmmState {
    Uninitialized,
    /// Bitmaps are wired but boot reservations are not yet applied.
    Partial,
    Complete,
}

/// Bytes of PAB needed to track `length` bytes of memory at `bits_per_state`.
#[must_use]
pub const fn pab_size(length: u64, bits_per_state: usize) -> usize {
    let frames = length.div_ceil(FRAME) as usize;
    (frames * bits_per_state).div_ceil(8)
}

/// Guard installed into every region bitmap.
///
/// Reserved frames of a one-bit PAB read as used, so the guard keeps their
/// runs as half-open index ranges.
#[derive(Debug, Clone)]
pub struct FrameGuard {
    usable_frames: usize,
    /// The region starts at physical address 0.
    null_frame: bool,
    runs: [(usize, usize); RESERVED_RUNS],
    run_count: usize,
}

impl FrameGuard {
    const fn new(usable_frames: usize, null_frame: bool) -> Self {
        Self {
            usable_frames,
            null_frame,
            runs: [(0, 0); RESERVED_RUNS],
            run_count: 0,
        }
    }

    /// First index that may ever change state.
    #[must_use]
    pub const fn first_frame(&self) -> usize {
        if self.null_frame { 1 } else { 0 }
    }

    /// Whether `index` lies in a recorded reserved run.
    #[must_use]
    pub fn is_reserved(&self, index: usize) -> bool {
        self.runs[..self.run_count]
            .iter()
            .any(|&(start, end)| (start..end).contains(&index))
    }

    #[track_caller]
    fn record_reserved(&mut self, index: usize, count: usize) {
        let end = index + count;
        for run in &mut self.runs[..self.run_count] {
            if run.1 == index {
                run.1 = end;
                return;
            }
            if run.0 == end {
                run.0 = index;
                return;
            }
        }
        if self.run_count == RESERVED_RUNS {
            fatal(Fatal::ReservationTableFull { frame: index });
        }
        self.runs[self.run_count] = (index, end);
        self.run_count += 1;
    }
}

impl TransitionGuard for FrameGuard {
    fn allow(&self, index: usize, old: u8, new: u8) -> bool {
        if index < self.first_frame() || index >= self.usable_frames {
            fatal(Fatal::FrameNotAllocatable { frame: index });
        }
        if self.is_reserved(index) {
            fatal(Fatal::FrameImmutable { frame: index });
        }
        match (old, new) {
            (RESERVED | INVALID, _) => fatal(Fatal::FrameImmutable { frame: index }),
            (USED, USED) => fatal(Fatal::FrameDoubleAlloc { frame: index }),
            (FREE, FREE) => fatal(Fatal::FrameDoubleFree { frame: index }),
            _ => true,
        }
    }
}

/// Description of one region handed to [`BitmapFrameAlloc::init`].
pub struct RegionConfig<'a> {
    pub kind: RegionKind,
    pub start: PhysicalAddress,
    /// Configured length in bytes; the usable part may be smaller.
    pub length: u64,
    /// Zeroed PAB storage, at least [`pab_size`] bytes.
    pub pab: &'a mut [u8],
    pub bits_per_state: usize,
}

/// One physical region and its PAB.
pub struct FrameRegion<'a> {
    kind: RegionKind,
    start: PhysicalAddress,
    length: u64,
    usable_frames: usize,
    bitmap: Bitmap<'a, FrameGuard>,
}

impl<'a> FrameRegion<'a> {
    fn new(config: RegionConfig<'a>, installed_ram: u64) -> Self {
        let start = u64::from(config.start.as_u32());
        let usable_bytes = installed_ram.saturating_sub(start).min(config.length);
        let wanted = usize::try_from(usable_bytes / FRAME).unwrap_or(usize::MAX);

        let capacity = config.pab.len() * (8 / config.bits_per_state.clamp(1, 8));
        let usable_frames = if wanted > capacity {
            log::warn!(
                "PAB of {} bytes covers only {capacity} of {wanted} frames at {}",
                config.pab.len(),
                config.start
            );
            capacity
        } else {
            wanted
        };

        Self {
            kind: config.kind,
            start: config.start,
            length: config.length,
            usable_frames,
            bitmap: Bitmap::new(
                config.pab,
                config.bits_per_state,
                FrameGuard::new(usable_frames, start == 0),
            ),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn usable_frames(&self) -> usize {
        self.usable_frames
    }

    /// The raw PAB.
    #[must_use]
    pub fn pab(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }

    #[must_use]
    pub fn frame_state(&self, index: usize) -> u8 {
        self.bitmap.get(index)
    }

    /// First frame index that may be handed out; 1 only for the region
    /// holding physical frame 0.
    #[must_use]
    pub const fn first_frame(&self) -> usize {
        self.bitmap.guard().first_frame()
    }

    /// Whether the frame at `index` is reserved, at any PAB width.
    #[must_use]
    pub fn is_reserved(&self, index: usize) -> bool {
        matches!(self.bitmap.get(index), RESERVED | INVALID)
            || self.bitmap.guard().is_reserved(index)
    }

    /// Marks `count` frames at `index` reserved. A one-bit PAB stores them as
    /// used and the guard records the run.
    fn reserve_run(&mut self, index: usize, count: usize) -> bool {
        if self.bitmap.bits_per_state() >= 2 {
            return self.bitmap.set_continuous(index, count, RESERVED);
        }
        if !self.bitmap.set_continuous(index, count, USED) {
            return false;
        }
        self.bitmap.guard_mut().record_reserved(index, count);
        true
    }

    fn end(&self) -> u64 {
        u64::from(self.start.as_u32()) + self.usable_frames as u64 * FRAME
    }

    fn contains(&self, pa: u64) -> bool {
        (u64::from(self.start.as_u32())..self.end()).contains(&pa)
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.start + (index as u32) * PAGE_SIZE
    }

    fn index_of(&self, pa: u64) -> usize {
        ((pa - u64::from(self.start.as_u32())) / FRAME) as usize
    }

    /// Frame indices that serve a request of `kind`, the null frame included.
    fn frames_for(&self, kind: RegionKind) -> Option<Range<usize>> {
        let bounds = kind.bounds();
        let lo = bounds.start.max(u64::from(self.start.as_u32()));
        let hi = bounds.end.min(self.end());
        if lo >= hi {
            return None;
        }
        Some(self.index_of(lo)..self.index_of(hi - 1) + 1)
    }

    fn allocate(&mut self, count: usize, kind: RegionKind) -> Option<PhysicalAddress> {
        let frames = self.frames_for(kind)?;
        let search = frames.start.max(self.first_frame())..frames.end;
        let index = self.bitmap.find_continuous_in(FREE, count, search)?;
        if !self.bitmap.set_continuous(index, count, USED) {
            return None;
        }
        Some(self.address_of(index))
    }

    fn free_frames(&self, kind: RegionKind) -> usize {
        self.frames_for(kind)
            .map_or(0, |frames| {
                self.bitmap
                    .count_in(FREE, frames.start.max(self.first_frame())..frames.end)
            })
    }

    /// Marks a frame reserved unless it already is not free.
    fn reserve_frame(&mut self, index: usize) {
        if index < self.first_frame()
            || index >= self.usable_frames
            || self.bitmap.get(index) != FREE
        {
            return;
        }
        self.reserve_run(index, 1);
    }

    fn reserve_span(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let first = start.max(u64::from(self.start.as_u32()));
        let last = (start + length).min(self.end());
        let mut pa = first - first % FRAME;
        while pa < last {
            let index = self.index_of(pa);
            self.reserve_frame(index);
            pa += FRAME;
        }
    }
}

impl fmt::Debug for FrameRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRegion")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("length", &self.length)
            .field("usable_frames", &self.usable_frames)
            .finish_non_exhaustive()
    }
}

/// The physical memory manager.
pub struct BitmapFrameAlloc<'a> {
    state: PmmState,
    regions: [Option<FrameRegion<'a>>; MAX_REGIONS],
}

impl Default for BitmapFrameAlloc<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BitmapFrameAlloc<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: PmmState::Uninitialized,
            regions: [None, None],
        }
    }

    #[must_use]
    pub const fn state(&self) -> PmmState {
        self.state
    }

    /// Wire the region bitmaps and apply the boot reservations.
    ///
    /// Every frame not covered by an available memory map entry, the kernel
    /// image and every loaded file become reserved. Regions are searched in
    /// the order given. Calling this twice stops the kernel.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] for zero or more than [`MAX_REGIONS`] regions.
    /// - [`MemError::WrongAlignment`] if a region does not start on a frame.
    #[track_caller]
    pub fn init<I>(&mut self, boot: &BootInfo<'_>, regions: I) -> Result<()>
    where
        I: IntoIterator<Item = RegionConfig<'a>>,
    {
        if self.state != PmmState::Uninitialized {
            fatal(Fatal::PmmAlreadyInitialized);
        }

        let installed = boot.installed_ram();
        let mut count = 0;
        for config in regions {
            if count == MAX_REGIONS {
                return Err(MemError::InvalidArgument);
            }
            if !config.start.is_aligned::<Size4K>() {
                return Err(MemError::WrongAlignment);
            }
            self.regions[count] = Some(FrameRegion::new(config, installed));
            count += 1;
        }
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        self.state = PmmState::Partial;

        self.reserve_boot_ranges(boot);
        self.state = PmmState::Complete;

        log::info!(
            "Physical memory: {} KiB installed, {} KiB usable, {} KiB free in {count} region(s)",
            installed / 1024,
            self.usable_memory_size(RegionKind::Any) / 1024,
            self.free_memory_size(RegionKind::Any) / 1024,
        );
        Ok(())
    }

    fn reserve_boot_ranges(&mut self, boot: &BootInfo<'_>) {
        for region in self.regions.iter_mut().flatten() {
            for index in region.first_frame()..region.usable_frames {
                let pa = u64::from(region.address_of(index).as_u32());
                if !boot.is_available(pa, FRAME) {
                    region.reserve_frame(index);
                }
            }
            for file in boot.occupied() {
                region.reserve_span(u64::from(file.start()), u64::from(file.length()));
            }
        }
    }

    #[track_caller]
    fn ensure_ready(&self) {
        if self.state != PmmState::Complete {
            fatal(Fatal::PmmNotInitialized);
        }
    }

    /// Allocate `count` consecutive frames.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutOfMemory`] if no run of free frames is long enough.
    #[track_caller]
    pub fn alloc(&mut self, count: usize, kind: RegionKind) -> Result<PhysicalAddress> {
        self.ensure_ready();
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        for region in self.regions.iter_mut().flatten() {
            if let Some(pa) = region.allocate(count, kind) {
                log::trace!("Allocated {count} frame(s) at {pa}");
                return Ok(pa);
            }
        }
        log::warn!("Out of physical memory allocating {count} frame(s) ({kind:?})");
        Err(MemError::OutOfMemory)
    }

    /// Allocate `count` frames starting exactly at `start`.
    ///
    /// Nothing is changed when any frame of the run is not free.
    ///
    /// # Errors
    /// - [`MemError::WrongAlignment`] if `start` is not frame aligned.
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutsideAddressableRange`] if the run is not usable memory of `kind`.
    /// - [`MemError::DoubleAlloc`] if any frame of the run is not free.
    #[track_caller]
    pub fn alloc_at(&mut self, start: PhysicalAddress, count: usize, kind: RegionKind) -> Result<()> {
        let (region, index) = self.locate_run(start, count, kind)?;
        if !region.bitmap.find_continuous_at(FREE, count, index) {
            return Err(MemError::DoubleAlloc);
        }
        if !region.bitmap.set_continuous(index, count, USED) {
            return Err(MemError::PageWrongState);
        }
        log::trace!("Allocated {count} frame(s) at {start} on request");
        Ok(())
    }

    /// Return `count` frames starting at `start`. Freeing a free frame stops
    /// the kernel.
    ///
    /// # Errors
    /// - [`MemError::WrongAlignment`] if `start` is not frame aligned.
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutsideAddressableRange`] if the run is not managed memory.
    #[track_caller]
    pub fn free(&mut self, start: PhysicalAddress, count: usize) -> Result<()> {
        let (region, index) = self.locate_run(start, count, RegionKind::Any)?;
        if !region.bitmap.set_continuous(index, count, FREE) {
            return Err(MemError::PageWrongState);
        }
        log::trace!("Freed {count} frame(s) at {start}");
        Ok(())
    }

    /// Mark `count` free frames at `start` as reserved.
    ///
    /// # Errors
    /// As [`alloc_at`](Self::alloc_at).
    #[track_caller]
    pub fn reserve(&mut self, start: PhysicalAddress, count: usize) -> Result<()> {
        let (region, index) = self.locate_run(start, count, RegionKind::Any)?;
        if !region.bitmap.find_continuous_at(FREE, count, index) {
            return Err(MemError::DoubleAlloc);
        }
        if !region.reserve_run(index, count) {
            return Err(MemError::PageWrongState);
        }
        log::debug!("Reserved {count} frame(s) at {start}");
        Ok(())
    }

    #[track_caller]
    fn locate_run(
        &mut self,
        start: PhysicalAddress,
        count: usize,
        kind: RegionKind,
    ) -> Result<(&mut FrameRegion<'a>, usize)> {
        self.ensure_ready();
        if !start.is_aligned::<Size4K>() {
            return Err(MemError::WrongAlignment);
        }
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        let pa = start.as_u64();
        let region = self
            .regions
            .iter_mut()
            .flatten()
            .find(|r| r.contains(pa))
            .ok_or(MemError::OutsideAddressableRange)?;
        let frames = region.frames_for(kind).ok_or(MemError::OutsideAddressableRange)?;
        let index = region.index_of(pa);
        match index.checked_add(count) {
            Some(end) if index >= frames.start && end <= frames.end => Ok((region, index)),
            _ => Err(MemError::OutsideAddressableRange),
        }
    }

    /// Kind of the region managing `pa`.
    #[must_use]
    pub fn region_of(&self, pa: PhysicalAddress) -> Option<RegionKind> {
        self.regions
            .iter()
            .flatten()
            .find(|r| r.contains(pa.as_u64()))
            .map(FrameRegion::kind)
    }

    #[must_use]
    pub fn regions(&self) -> impl Iterator<Item = &FrameRegion<'a>> {
        self.regions.iter().flatten()
    }

    /// Bytes currently free for requests of `kind`.
    #[must_use]
    pub fn free_memory_size(&self, kind: RegionKind) -> u64 {
        self.regions()
            .map(|r| r.free_frames(kind) as u64 * FRAME)
            .sum()
    }

    /// Bytes of usable memory for requests of `kind`: per region
    /// `min(installed RAM - start, length)`, fixed at [`init`](Self::init).
    #[must_use]
    pub fn usable_memory_size(&self, kind: RegionKind) -> u64 {
        self.regions()
            .filter_map(|r| r.frames_for(kind))
            .map(|frames| frames.len() as u64 * FRAME)
            .sum()
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc(1, RegionKind::Any)
            .ok()
            .map(PhysicalPage::containing_address)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) -> Result<()> {
        self.free(page.base(), 1)
    }
}
