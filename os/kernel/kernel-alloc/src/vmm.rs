//! # Virtual Memory Manager (VMM)
//!
//! Bookkeeping of reserved virtual regions ("VAS" descriptors) per owner and
//! the glue that backs them with physical frames.
//!
//! Every owner (the kernel is owner 0, processes use their ID) has one
//! [`VasList`]: descriptors kept in an index arena and linked in strictly
//! ascending address order. A [`Vmm`] is a short-lived view that combines one
//! list with its address space, the frame allocator and the pool of
//! [`MemoryShare`]s.
//!
//! ```text
//!  base                                                        limit
//!   │ [VAS a]      [VAS b][VAS c]           [VAS d]              │
//!   └──────── gaps are searched first-fit, left to right ────────┘
//! ```
//!
//! Regions are committed right away unless [`VasFlags::NOT_PRESENT`] is
//! given; those pages are committed one by one from the page-fault handler
//! through [`Vmm::commit_page`].

use bitflags::bitflags;
use core::fmt;
use kernel_error::{Fatal, MemError, Result, fatal};
use kernel_info::memory::{
    KERNEL_BASE, KERNEL_LOW_REGION_END, KERNEL_LOW_REGION_START, PAGE_SIZE,
    PROCESS_ADDR_SPACE_END, PROCESS_ADDR_SPACE_START,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, PageEntryBits, PhysMapper, TemporaryWindow};

const PAGE: u64 = PAGE_SIZE as u64;

/// Owner ID of the kernel's own address space.
pub const KERNEL_OWNER: u32 = 0;

bitflags! {
    /// Properties of a reserved region.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct VasFlags: u32 {
        /// Supervisor only.
        const KERNEL = 1 << 0;
        /// Region may be extended (stacks, heaps).
        const GROWABLE = 1 << 1;
        /// Frames were mapped outside the VMM and are never released by it.
        const STATIC_ALLOC = 1 << 2;
        const WRITABLE = 1 << 3;
        const CACHE_ENABLED = 1 << 4;
        /// Reserve only; pages are committed on first touch.
        const NOT_PRESENT = 1 << 5;
    }
}

impl VasFlags {
    /// Leaf entry bits for pages of a region with these flags.
    #[must_use]
    pub fn entry_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.contains(Self::WRITABLE))
            .with_user_access(!self.contains(Self::KERNEL))
            .with_cache_disabled(!self.contains(Self::CACHE_ENABLED))
    }
}

/// Index of a descriptor in its [`VasList`] arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VasId(u16);

/// Index of a [`MemoryShare`] in its [`SharePool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShareId(u16);

impl ShareId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A reserved virtual region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Vas {
    start: VirtualAddress,
    reserved_pages: u32,
    allocated_pages: u32,
    owner: u32,
    flags: VasFlags,
    share: Option<ShareId>,
    next: Option<VasId>,
}

impl Vas {
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn reserved_pages(&self) -> u32 {
        self.reserved_pages
    }

    /// Pages backed by a frame.
    #[must_use]
    pub const fn allocated_pages(&self) -> u32 {
        self.allocated_pages
    }

    #[must_use]
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    #[must_use]
    pub const fn flags(&self) -> VasFlags {
        self.flags
    }

    #[must_use]
    pub const fn share(&self) -> Option<ShareId> {
        self.share
    }

    /// First address past the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.as_u32() as u64 + self.reserved_pages as u64 * PAGE
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        let va = va.as_u32() as u64;
        va >= self.start.as_u32() as u64 && va < self.end()
    }

    fn page(&self, i: u32) -> VirtualAddress {
        self.start + i * PAGE_SIZE
    }
}

/// Physical pages mapped by more than one region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryShare {
    refcount: u32,
    pages: u32,
}

impl MemoryShare {
    #[must_use]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }

    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.pages
    }
}

/// Arena of [`MemoryShare`]s, common to all owners.
pub struct SharePool<'a> {
    slots: &'a mut [Option<MemoryShare>],
}

impl<'a> SharePool<'a> {
    pub const fn new(slots: &'a mut [Option<MemoryShare>]) -> Self {
        Self { slots }
    }

    #[must_use]
    pub fn get(&self, id: ShareId) -> Option<&MemoryShare> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn create(&mut self, pages: u32) -> Result<ShareId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(MemError::OutOfMemory)?;
        self.slots[index] = Some(MemoryShare { refcount: 1, pages });
        Ok(ShareId(u16::try_from(index).map_err(|_| MemError::OutOfMemory)?))
    }

    #[track_caller]
    fn slot_mut(&mut self, id: ShareId) -> &mut MemoryShare {
        match self.slots.get_mut(id.index()) {
            Some(Some(share)) => share,
            _ => fatal(Fatal::ShareUnderflow { index: id.index() }),
        }
    }

    fn acquire(&mut self, id: ShareId) {
        self.slot_mut(id).refcount += 1;
    }

    /// Drops one reference; `true` when it was the last one.
    #[track_caller]
    fn release(&mut self, id: ShareId) -> bool {
        let share = self.slot_mut(id);
        share.refcount -= 1;
        if share.refcount == 0 {
            self.slots[id.index()] = None;
            return true;
        }
        false
    }
}

/// Address-sorted list of the regions of one owner.
pub struct VasList<'a> {
    owner: u32,
    directory: PhysicalPage<Size4K>,
    base: VirtualAddress,
    limit: VirtualAddress,
    head: Option<VasId>,
    slots: &'a mut [Option<Vas>],
}

impl<'a> VasList<'a> {
    /// The kernel's list: searches start at [`KERNEL_LOW_REGION_START`].
    pub const fn kernel(directory: PhysicalPage<Size4K>, slots: &'a mut [Option<Vas>]) -> Self {
        Self {
            owner: KERNEL_OWNER,
            directory,
            base: VirtualAddress::new(KERNEL_LOW_REGION_START),
            limit: VirtualAddress::new(KERNEL_LOW_REGION_END),
            head: None,
            slots,
        }
    }

    /// A process list: searches start at [`PROCESS_ADDR_SPACE_START`].
    pub const fn process(owner: u32, directory: PhysicalPage<Size4K>, slots: &'a mut [Option<Vas>]) -> Self {
        Self {
            owner,
            directory,
            base: VirtualAddress::new(PROCESS_ADDR_SPACE_START),
            limit: VirtualAddress::new(PROCESS_ADDR_SPACE_END),
            head: None,
            slots,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    /// Page directory of the owner's address space.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.directory
    }

    /// Lowest address [`reserve_at`](Vmm::reserve_at) accepts.
    const fn floor(&self) -> u64 {
        if self.owner == KERNEL_OWNER {
            KERNEL_BASE as u64
        } else {
            PROCESS_ADDR_SPACE_START as u64
        }
    }

    #[track_caller]
    fn slot(&self, id: VasId) -> &Vas {
        match self.slots.get(id.0 as usize) {
            Some(Some(vas)) => vas,
            _ => fatal(Fatal::VasSlotEmpty { index: id.0 as usize }),
        }
    }

    #[track_caller]
    fn slot_mut(&mut self, id: VasId) -> &mut Vas {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(vas)) => vas,
            _ => fatal(Fatal::VasSlotEmpty { index: id.0 as usize }),
        }
    }

    fn ids(&self) -> impl Iterator<Item = VasId> + '_ {
        core::iter::successors(self.head, |&id| self.slot(id).next)
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vas> + '_ {
        self.ids().map(|id| self.slot(id))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The region containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Vas> {
        self.iter().find(|v| v.contains(va))
    }

    fn find_id(&self, va: VirtualAddress) -> Option<VasId> {
        self.ids().find(|&id| self.slot(id).contains(va))
    }

    /// Descriptor starting exactly at `start` and its predecessor.
    fn position(&self, start: VirtualAddress) -> Option<(Option<VasId>, VasId)> {
        let mut prev = None;
        for id in self.ids() {
            let vas = self.slot(id);
            if vas.start == start {
                return Some((prev, id));
            }
            if vas.start > start {
                break;
            }
            prev = Some(id);
        }
        None
    }

    /// Total reserved pages.
    #[must_use]
    pub fn reserved_pages(&self) -> u64 {
        self.iter().map(|v| u64::from(v.reserved_pages)).sum()
    }

    /// Total committed pages.
    #[must_use]
    pub fn allocated_pages(&self) -> u64 {
        self.iter().map(|v| u64::from(v.allocated_pages)).sum()
    }

    /// First gap of `count` pages at or above the default base, and the
    /// descriptor it follows.
    fn find_gap(&self, count: u32) -> Option<(VirtualAddress, Option<VasId>)> {
        let need = u64::from(count) * PAGE;
        let mut cursor = u64::from(self.base.as_u32());
        let mut prev = None;
        for id in self.ids() {
            let vas = self.slot(id);
            let start = u64::from(vas.start.as_u32());
            if start >= cursor && start - cursor >= need {
                break;
            }
            cursor = cursor.max(vas.end());
            prev = Some(id);
        }
        if u64::from(self.limit.as_u32()).saturating_sub(cursor) < need {
            return None;
        }
        Some((VirtualAddress::new(u32::try_from(cursor).ok()?), prev))
    }

    /// Insertion point for `[start, start + count)`; `None` if it overlaps.
    fn insertion_point(&self, start: VirtualAddress, count: u32) -> Option<Option<VasId>> {
        let lo = u64::from(start.as_u32());
        let hi = lo + u64::from(count) * PAGE;
        let mut prev = None;
        for id in self.ids() {
            let vas = self.slot(id);
            let vs = u64::from(vas.start.as_u32());
            if vs >= hi {
                break;
            }
            if vas.end() > lo {
                return None;
            }
            prev = Some(id);
        }
        Some(prev)
    }

    /// Link `vas` after `prev`, checking the ordering invariant.
    #[track_caller]
    fn insert(&mut self, prev: Option<VasId>, mut vas: Vas) -> Result<VasId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(MemError::OutOfMemory)?;
        let id = VasId(u16::try_from(index).map_err(|_| MemError::OutOfMemory)?);

        let next = match prev {
            Some(p) => self.slot(p).next,
            None => self.head,
        };
        let ordered_after = prev.is_none_or(|p| self.slot(p).end() <= u64::from(vas.start.as_u32()));
        let ordered_before = next.is_none_or(|n| vas.end() <= u64::from(self.slot(n).start.as_u32()));
        if !ordered_after || !ordered_before {
            fatal(Fatal::VasOrder {
                addr: vas.start.as_u32(),
            });
        }

        vas.next = next;
        self.slots[index] = Some(vas);
        match prev {
            Some(p) => self.slot_mut(p).next = Some(id),
            None => self.head = Some(id),
        }
        Ok(id)
    }

    fn remove(&mut self, prev: Option<VasId>, id: VasId) {
        let next = self.slot(id).next;
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        self.slots[id.0 as usize] = None;
    }
}

impl fmt::Debug for VasList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VasList")
            .field("owner", &self.owner)
            .field("directory", &self.directory)
            .field("regions", &self.iter().count())
            .finish_non_exhaustive()
    }
}

/// Virtual memory operations on one owner's address space.
pub struct Vmm<'m, 'a, M: PhysMapper, A: FrameAlloc> {
    space: AddressSpace<'m, M>,
    frames: &'m mut A,
    shares: &'m mut SharePool<'a>,
    list: &'m mut VasList<'a>,
}

impl<'m, 'a, M: PhysMapper, A: FrameAlloc> Vmm<'m, 'a, M, A> {
    pub fn new(
        window: &'m TemporaryWindow<M>,
        frames: &'m mut A,
        shares: &'m mut SharePool<'a>,
        list: &'m mut VasList<'a>,
    ) -> Self {
        let space = AddressSpace::from_directory(window, list.directory());
        Self {
            space,
            frames,
            shares,
            list,
        }
    }

    #[must_use]
    pub fn list(&self) -> &VasList<'a> {
        self.list
    }

    #[must_use]
    pub const fn space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    fn normalize(&self, flags: VasFlags) -> VasFlags {
        if self.list.owner == KERNEL_OWNER {
            flags | VasFlags::KERNEL
        } else {
            flags - VasFlags::KERNEL
        }
    }

    /// Reserve `count` pages at the first fitting gap and commit them unless
    /// `NOT_PRESENT` is set.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutOfMemory`] if no gap fits or frames run out.
    pub fn alloc_pages(&mut self, count: u32, flags: VasFlags) -> Result<VirtualAddress> {
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        let Some((start, prev)) = self.list.find_gap(count) else {
            log::warn!("No virtual gap of {count} pages for owner {}", self.list.owner);
            return Err(MemError::OutOfMemory);
        };
        self.reserve_linked(prev, start, count, flags)?;
        Ok(start)
    }

    /// Reserve `count` pages at exactly `start`.
    ///
    /// # Errors
    /// - [`MemError::WrongAlignment`] if `start` is not page aligned.
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutsideAddressableRange`] if the range leaves the owner's half.
    /// - [`MemError::DoubleAlloc`] if it overlaps an existing region.
    pub fn reserve_at(&mut self, start: VirtualAddress, count: u32, flags: VasFlags) -> Result<()> {
        if !start.is_aligned::<Size4K>() {
            return Err(MemError::WrongAlignment);
        }
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        let lo = u64::from(start.as_u32());
        let hi = lo + u64::from(count) * PAGE;
        if lo < self.list.floor() || hi > u64::from(self.list.limit.as_u32()) {
            return Err(MemError::OutsideAddressableRange);
        }
        let prev = self
            .list
            .insertion_point(start, count)
            .ok_or(MemError::DoubleAlloc)?;
        self.reserve_linked(prev, start, count, flags)
    }

    fn reserve_linked(
        &mut self,
        prev: Option<VasId>,
        start: VirtualAddress,
        count: u32,
        flags: VasFlags,
    ) -> Result<()> {
        let flags = self.normalize(flags);
        let id = self.list.insert(
            prev,
            Vas {
                start,
                reserved_pages: count,
                allocated_pages: 0,
                owner: self.list.owner,
                flags,
                share: None,
                next: None,
            },
        )?;

        if !flags.intersects(VasFlags::NOT_PRESENT | VasFlags::STATIC_ALLOC) {
            for i in 0..count {
                let va = start + i * PAGE_SIZE;
                if let Err(e) = self.commit_one(va, flags) {
                    self.release_pages(start, i, true)?;
                    self.list.remove(prev, id);
                    return Err(e);
                }
            }
            self.list.slot_mut(id).allocated_pages = count;
        }

        log::debug!(
            "Reserved {count} page(s) at {start} for owner {} ({flags:?})",
            self.list.owner
        );
        Ok(())
    }

    fn commit_one(&mut self, va: VirtualAddress, flags: VasFlags) -> Result<PhysicalAddress> {
        let frame = self.frames.alloc_4k().ok_or(MemError::OutOfMemory)?;
        self.space.window().zero_frame(frame);
        if let Err(e) = self.space.map(self.frames, va, frame.base(), flags.entry_bits()) {
            self.frames.free_4k(frame)?;
            return Err(e);
        }
        Ok(frame.base())
    }

    /// Unmap `count` pages from `start`, freeing their frames if asked.
    /// Pages that were never committed are skipped.
    fn release_pages(&mut self, start: VirtualAddress, count: u32, free_frames: bool) -> Result<()> {
        for i in 0..count {
            match self.space.unmap(start + i * PAGE_SIZE) {
                Ok(frame) if free_frames => self.frames.free_4k(frame)?,
                Ok(_) | Err(MemError::DoubleFree) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Back the page containing `addr` with a fresh zeroed frame.
    ///
    /// # Errors
    /// - [`MemError::OutsideAddressableRange`] if no region covers `addr`.
    /// - [`MemError::PageWrongState`] if the region is `STATIC_ALLOC`; its
    ///   frames belong to whoever maps them.
    /// - [`MemError::DoubleAlloc`] if the page is already committed.
    /// - [`MemError::OutOfMemory`] if no frame is left.
    pub fn commit_page(&mut self, addr: VirtualAddress) -> Result<PhysicalAddress> {
        let id = self
            .list
            .find_id(addr)
            .ok_or(MemError::OutsideAddressableRange)?;
        let flags = self.list.slot(id).flags;
        if flags.contains(VasFlags::STATIC_ALLOC) {
            return Err(MemError::PageWrongState);
        }
        let page = addr.page::<Size4K>().base();
        if self.space.does_mapping_exist(page) {
            return Err(MemError::DoubleAlloc);
        }
        let pa = self.commit_one(page, flags)?;
        self.list.slot_mut(id).allocated_pages += 1;
        log::trace!("Committed {page} -> {pa}");
        Ok(pa)
    }

    /// Remove the region starting at `start`, unmapping its pages.
    ///
    /// Frames are released unless the region is `STATIC_ALLOC` or shared
    /// with a region that still exists.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if no region starts at `start`.
    pub fn unreserve(&mut self, start: VirtualAddress) -> Result<()> {
        let (prev, id) = self
            .list
            .position(start)
            .ok_or(MemError::InvalidArgument)?;
        let vas = *self.list.slot(id);

        let last_holder = vas.share.is_none_or(|share| self.shares.release(share));
        let free_frames = last_holder && !vas.flags.contains(VasFlags::STATIC_ALLOC);
        self.release_pages(vas.start, vas.reserved_pages, free_frames)?;
        self.list.remove(prev, id);

        log::debug!(
            "Unreserved {} page(s) at {} for owner {}",
            vas.reserved_pages,
            vas.start,
            vas.owner
        );
        Ok(())
    }

    /// Remove every region of this owner.
    ///
    /// # Errors
    /// Propagates the first failure of [`unreserve`](Self::unreserve).
    pub fn unreserve_all(&mut self) -> Result<()> {
        while let Some(id) = self.list.head {
            let start = self.list.slot(id).start;
            self.unreserve(start)?;
        }
        Ok(())
    }

    /// Map the frames of the region starting at `start` into `target` as a
    /// new region there. Both regions then reference one [`MemoryShare`].
    ///
    /// Returns the start of the new region.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if no region starts at `start`.
    /// - [`MemError::InvalidRange`] if `count` does not cover the whole region.
    /// - [`MemError::PageWrongState`] if the region is not fully committed.
    /// - [`MemError::OutOfMemory`] if `target` has no gap or no free slot.
    pub fn share_mapping(
        &mut self,
        start: VirtualAddress,
        count: u32,
        target: &mut VasList<'a>,
    ) -> Result<VirtualAddress> {
        let (_, id) = self
            .list
            .position(start)
            .ok_or(MemError::InvalidArgument)?;
        let vas = *self.list.slot(id);
        if count != vas.reserved_pages {
            return Err(MemError::InvalidRange);
        }
        if vas.allocated_pages != vas.reserved_pages {
            return Err(MemError::PageWrongState);
        }

        let (target_start, prev) = target.find_gap(count).ok_or(MemError::OutOfMemory)?;
        let share = match vas.share {
            Some(share) => share,
            None => {
                let share = self.shares.create(count)?;
                self.list.slot_mut(id).share = Some(share);
                share
            }
        };

        let flags = if target.owner == KERNEL_OWNER {
            vas.flags | VasFlags::KERNEL
        } else {
            vas.flags - VasFlags::KERNEL
        };
        let target_id = target.insert(
            prev,
            Vas {
                start: target_start,
                reserved_pages: count,
                allocated_pages: count,
                owner: target.owner,
                flags,
                share: Some(share),
                next: None,
            },
        )?;
        self.shares.acquire(share);

        let target_space = AddressSpace::from_directory(self.space.window(), target.directory);
        for i in 0..count {
            let mapped = self
                .space
                .query(vas.page(i))
                .ok_or(MemError::PageWrongState)
                .and_then(|pa| {
                    target_space.map(self.frames, target_start + i * PAGE_SIZE, pa, flags.entry_bits())
                });
            if let Err(e) = mapped {
                for j in 0..i {
                    target_space.unmap(target_start + j * PAGE_SIZE)?;
                }
                target.remove(prev, target_id);
                self.shares.release(share);
                return Err(e);
            }
        }

        log::debug!(
            "Shared {count} page(s) at {start} of owner {} with owner {} at {target_start}",
            self.list.owner,
            target.owner
        );
        Ok(target_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::DirectoryFlags;
    use kernel_vmem::sim::{BumpAlloc, SimulatedRam};

    fn directory(window: &TemporaryWindow<&SimulatedRam>, frames: &mut BumpAlloc) -> PhysicalPage<Size4K> {
        AddressSpace::create(window, frames, DirectoryFlags::empty(), None)
            .unwrap()
            .directory()
    }

    #[test]
    fn gaps_are_found_first_fit() {
        let ram = SimulatedRam::with_frames(64);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 64);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 8];
        let mut share_slots = [None; 2];
        let mut list = VasList::process(7, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);

        let flags = VasFlags::WRITABLE | VasFlags::NOT_PRESENT;
        let a = vmm.alloc_pages(2, flags).unwrap();
        let b = vmm.alloc_pages(1, flags).unwrap();
        let c = vmm.alloc_pages(3, flags).unwrap();
        assert_eq!(a.as_u32(), PROCESS_ADDR_SPACE_START);
        assert_eq!(b.as_u32(), PROCESS_ADDR_SPACE_START + 0x2000);
        assert_eq!(c.as_u32(), PROCESS_ADDR_SPACE_START + 0x3000);

        vmm.unreserve(a).unwrap();
        // Too large for the hole left by `a`.
        let d = vmm.alloc_pages(3, flags).unwrap();
        assert_eq!(d.as_u32(), PROCESS_ADDR_SPACE_START + 0x6000);
        let e = vmm.alloc_pages(2, flags).unwrap();
        assert_eq!(e, a);

        let starts: Vec<u32> = vmm.list().iter().map(|v| v.start().as_u32()).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(vmm.list().reserved_pages(), 9);
        assert_eq!(vmm.list().allocated_pages(), 0);
    }

    #[test]
    fn committed_regions_are_mapped_and_released() {
        let ram = SimulatedRam::with_frames(64);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 64);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 4];
        let mut share_slots = [None; 1];
        let mut list = VasList::kernel(pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);

        let va = vmm.alloc_pages(2, VasFlags::WRITABLE).unwrap();
        assert_eq!(va.as_u32(), KERNEL_LOW_REGION_START);
        assert!(vmm.space().does_mapping_exist(va));
        assert!(vmm.space().does_mapping_exist(va + PAGE_SIZE));
        let vas = vmm.list().find(va + 0x1234).unwrap();
        assert_eq!(vas.allocated_pages(), 2);
        assert!(vas.flags().contains(VasFlags::KERNEL));

        vmm.unreserve(va).unwrap();
        assert!(!vmm.space().does_mapping_exist(va));
        assert!(vmm.list().is_empty());
        drop(vmm);
        // Page table stays; both data frames came back.
        assert_eq!(frames.freed().len(), 2);
    }

    #[test]
    fn demand_commit() {
        let ram = SimulatedRam::with_frames(64);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 64);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 4];
        let mut share_slots = [None; 1];
        let mut list = VasList::process(3, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);

        let va = vmm
            .alloc_pages(4, VasFlags::WRITABLE | VasFlags::NOT_PRESENT | VasFlags::GROWABLE)
            .unwrap();
        assert!(!vmm.space().does_mapping_exist(va));

        let pa = vmm.commit_page(va + 0x2010).unwrap();
        assert_eq!(vmm.space().query(va + 0x2000), Some(pa));
        assert_eq!(vmm.commit_page(va + 0x2000), Err(MemError::DoubleAlloc));
        assert_eq!(
            vmm.commit_page(VirtualAddress::new(0x0900_0000)),
            Err(MemError::OutsideAddressableRange)
        );
        assert_eq!(vmm.list().find(va).unwrap().allocated_pages(), 1);
    }

    #[test]
    fn static_regions_are_not_committed() {
        let ram = SimulatedRam::with_frames(16);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 16);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 2];
        let mut share_slots = [None; 1];
        let mut list = VasList::process(3, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);

        let at = VirtualAddress::new(0x0800_0000);
        vmm.reserve_at(at, 2, VasFlags::WRITABLE | VasFlags::STATIC_ALLOC).unwrap();
        assert_eq!(vmm.commit_page(at + 0x1000), Err(MemError::PageWrongState));
        assert!(!vmm.space().does_mapping_exist(at + 0x1000));
        assert_eq!(vmm.list().find(at).unwrap().allocated_pages(), 0);
    }

    #[test]
    fn reserve_at_rejects_overlap_and_foreign_range() {
        let ram = SimulatedRam::with_frames(16);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 16);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 4];
        let mut share_slots = [None; 1];
        let mut list = VasList::process(3, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);
        let flags = VasFlags::NOT_PRESENT;

        let at = VirtualAddress::new(0x0800_0000);
        vmm.reserve_at(at, 4, flags).unwrap();
        assert_eq!(vmm.reserve_at(at + 0x3000, 1, flags), Err(MemError::DoubleAlloc));
        assert_eq!(vmm.reserve_at(VirtualAddress::new(0x07FF_F000), 2, flags), Err(MemError::DoubleAlloc));
        vmm.reserve_at(at + 0x4000, 1, flags).unwrap();
        vmm.reserve_at(VirtualAddress::new(0x07FF_F000), 1, flags).unwrap();
        assert_eq!(
            vmm.reserve_at(VirtualAddress::new(KERNEL_BASE), 1, flags),
            Err(MemError::OutsideAddressableRange)
        );
        assert_eq!(vmm.reserve_at(at + 0x10, 1, flags), Err(MemError::WrongAlignment));
        assert_eq!(vmm.unreserve(at + 0x1000), Err(MemError::InvalidArgument));
    }

    #[test]
    fn slots_run_out() {
        let ram = SimulatedRam::with_frames(16);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 16);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 1];
        let mut share_slots = [None; 1];
        let mut list = VasList::process(3, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);
        vmm.alloc_pages(1, VasFlags::NOT_PRESENT).unwrap();
        assert_eq!(vmm.alloc_pages(1, VasFlags::NOT_PRESENT), Err(MemError::OutOfMemory));
    }

    #[test]
    fn out_of_frames_rolls_back() {
        let ram = SimulatedRam::with_frames(8);
        let window = TemporaryWindow::new(&ram);
        // Directory, one page table, two data frames.
        let mut frames = BumpAlloc::new(1, 5);
        let pd = directory(&window, &mut frames);
        let mut slots = [None; 2];
        let mut share_slots = [None; 1];
        let mut list = VasList::process(3, pd, &mut slots);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list);

        assert_eq!(vmm.alloc_pages(3, VasFlags::WRITABLE), Err(MemError::OutOfMemory));
        assert!(vmm.list().is_empty());
        assert!(!vmm.space().does_mapping_exist(VirtualAddress::new(PROCESS_ADDR_SPACE_START)));
        drop(vmm);
        assert_eq!(frames.freed().len(), 2);
    }

    #[test]
    fn shared_frames_outlive_the_first_holder() {
        let ram = SimulatedRam::with_frames(64);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 64);
        let pd_a = directory(&window, &mut frames);
        let pd_b = directory(&window, &mut frames);
        let mut slots_a = [None; 4];
        let mut slots_b = [None; 4];
        let mut share_slots = [None; 2];
        let mut list_a = VasList::process(1, pd_a, &mut slots_a);
        let mut list_b = VasList::process(2, pd_b, &mut slots_b);
        let mut shares = SharePool::new(&mut share_slots);

        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list_a);
        let src = vmm.alloc_pages(2, VasFlags::WRITABLE).unwrap();
        let pa = vmm.space().query(src).unwrap();
        assert_eq!(vmm.share_mapping(src, 1, &mut list_b), Err(MemError::InvalidRange));
        let dst = vmm.share_mapping(src, 2, &mut list_b).unwrap();
        let share = vmm.list().find(src).unwrap().share().unwrap();
        vmm.unreserve(src).unwrap();
        drop(vmm);
        assert!(frames.freed().is_empty());
        assert_eq!(shares.get(share).map(MemoryShare::refcount), Some(1));

        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list_b);
        assert_eq!(vmm.space().query(dst), Some(pa));
        vmm.unreserve_all().unwrap();
        drop(vmm);
        assert_eq!(frames.freed().len(), 2);
        assert!(shares.get(share).is_none());
    }

    #[test]
    fn partially_committed_regions_cannot_be_shared() {
        let ram = SimulatedRam::with_frames(16);
        let window = TemporaryWindow::new(&ram);
        let mut frames = BumpAlloc::new(1, 16);
        let pd_a = directory(&window, &mut frames);
        let pd_b = directory(&window, &mut frames);
        let mut slots_a = [None; 2];
        let mut slots_b = [None; 2];
        let mut share_slots = [None; 1];
        let mut list_a = VasList::process(1, pd_a, &mut slots_a);
        let mut list_b = VasList::process(2, pd_b, &mut slots_b);
        let mut shares = SharePool::new(&mut share_slots);
        let mut vmm = Vmm::new(&window, &mut frames, &mut shares, &mut list_a);
        let src = vmm.alloc_pages(2, VasFlags::NOT_PRESENT).unwrap();
        assert_eq!(vmm.share_mapping(src, 2, &mut list_b), Err(MemError::PageWrongState));
        assert!(list_b.is_empty());
    }

    #[test]
    fn entry_bits_follow_flags() {
        let user = (VasFlags::WRITABLE | VasFlags::CACHE_ENABLED).entry_bits();
        assert!(user.present() && user.writable() && user.user_access() && !user.cache_disabled());
        let kernel = VasFlags::KERNEL.entry_bits();
        assert!(!kernel.writable() && !kernel.user_access() && kernel.cache_disabled());
    }
}
