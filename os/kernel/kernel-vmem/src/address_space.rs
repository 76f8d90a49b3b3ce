//! # Address Space (x86, page-directory rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space (a page directory and the page tables it references).
//!
//! ## Highlights
//!
//! - [`AddressSpace::create`] to allocate a directory, optionally sharing the
//!   kernel half of a template and installing the recursive entry.
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] for single 4 KiB pages.
//! - [`AddressSpace::query`] to translate a VA to PA (handles 4 MiB leaves).
//! - [`AddressSpace::destroy`] to release the user-half tables and the
//!   directory frame.
//! - [`AddressSpace::activate`] to load CR3 with this space's directory.
//!
//! ## Design
//!
//! - Page tables are created with user access below
//!   [`KERNEL_BASE`](kernel_info::memory::KERNEL_BASE) and supervisor-only
//!   above it. Leaf flags come from the mapping call.
//! - Directory and table frames are only touched through the
//!   [`TemporaryWindow`], one at a time: read the PDE, release the window,
//!   then open the page table.

use crate::page_table::pd::{L2Index, PdEntry, PdEntryKind};
use crate::page_table::pt::{L1Index, PtEntry};
use crate::page_table::{ENTRIES, split_indices};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, TemporaryWindow};
use bitflags::bitflags;
use kernel_error::{Fatal, MemError, OrFatal, Result};
use kernel_info::memory::{KERNEL_BASE, KERNEL_PDE_START, RECURSIVE_ENTRY};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage,
};

bitflags! {
    /// Options for [`AddressSpace::create`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DirectoryFlags: u8 {
        /// Share the kernel half (entries 768 and up) of the template directory.
        const COPY_KERNEL = 1 << 0;
        /// Point the last directory entry back at the directory itself.
        const RECURSIVE = 1 << 1;
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'w, M: PhysMapper> {
    directory: PhysicalPage<Size4K>,
    window: &'w TemporaryWindow<M>,
}

impl<'w, M: PhysMapper> AddressSpace<'w, M> {
    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - Assumes CR3 points at a valid page directory.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[inline]
    pub unsafe fn from_current(window: &'w TemporaryWindow<M>) -> Self {
        use kernel_registers::{Cr3, LoadRegisterUnsafe};
        let cr3 = unsafe { Cr3::load_unsafe() };
        Self::from_directory(window, PhysicalPage::containing_address(cr3.directory_phys()))
    }

    /// Wrap an existing directory frame.
    #[inline]
    pub const fn from_directory(window: &'w TemporaryWindow<M>, directory: PhysicalPage<Size4K>) -> Self {
        Self { directory, window }
    }

    /// Load CR3 with this address space's directory.
    ///
    /// # Safety
    /// The kernel half of the directory must map the code currently running.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[inline]
    pub unsafe fn activate(&self) {
        use kernel_registers::{Cr3, StoreRegisterUnsafe};
        let cr3 = Cr3::from_directory_phys(self.directory.base(), false, false);
        unsafe { cr3.store_unsafe() };
    }

    /// Physical frame of the page directory.
    #[inline]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.directory
    }

    #[inline]
    pub const fn window(&self) -> &'w TemporaryWindow<M> {
        self.window
    }

    /// Allocate and initialize a fresh page directory.
    ///
    /// With [`DirectoryFlags::COPY_KERNEL`] the kernel entries of `template`
    /// (except the recursive slot) are copied, so kernel page tables are
    /// shared between all spaces.
    ///
    /// # Errors
    /// - [`MemError::OutOfMemory`] if no frame is left for the directory.
    /// - [`MemError::InvalidArgument`] if `COPY_KERNEL` is requested without a template.
    pub fn create<A: FrameAlloc>(
        window: &'w TemporaryWindow<M>,
        alloc: &mut A,
        flags: DirectoryFlags,
        template: Option<PhysicalPage<Size4K>>,
    ) -> Result<Self> {
        let template = match (flags.contains(DirectoryFlags::COPY_KERNEL), template) {
            (true, None) => return Err(MemError::InvalidArgument),
            (true, Some(t)) => Some(t),
            (false, _) => None,
        };

        let directory = alloc.alloc_4k().ok_or(MemError::OutOfMemory)?;

        let mut kernel = [PdEntry::zero(); ENTRIES - KERNEL_PDE_START];
        if let Some(template) = template {
            window.with_directory(template, |pd| kernel.copy_from_slice(pd.kernel_entries()));
            kernel[RECURSIVE_ENTRY - KERNEL_PDE_START] = PdEntry::zero();
        }
        if flags.contains(DirectoryFlags::RECURSIVE) {
            kernel[RECURSIVE_ENTRY - KERNEL_PDE_START] =
                PdEntry::make_next(directory, PageEntryBits::new_kernel_rw());
        }

        window.with_directory(directory, |pd| {
            pd.zero();
            pd.kernel_entries_mut().copy_from_slice(&kernel);
        });

        log::debug!("Created page directory at {directory} ({flags:?})");
        Ok(Self::from_directory(window, directory))
    }

    /// Make sure a page table covers `va`, allocating and linking one if needed.
    ///
    /// Running out of frames here is fatal.
    ///
    /// # Errors
    /// - [`MemError::DoubleAlloc`] if the region is covered by a 4 MiB leaf.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>> {
        let i2 = L2Index::from(va);
        match self.window.with_directory(self.directory, |pd| pd.get(i2).kind()) {
            Some(PdEntryKind::NextPageTable(pt, _)) => return Ok(pt),
            Some(PdEntryKind::Leaf4MiB(..)) => return Err(MemError::DoubleAlloc),
            None => {}
        }

        let pt = alloc.alloc_4k().or_fatal(Fatal::PageTableAllocation);
        self.window.zero_frame(pt);

        let nonleaf = if va.as_u32() < KERNEL_BASE {
            PageEntryBits::new_user_rw()
        } else {
            PageEntryBits::new_kernel_rw()
        };
        self.window
            .with_directory(self.directory, |pd| pd.set(i2, PdEntry::make_next(pt, nonleaf)));

        log::trace!("New page table {pt} for directory entry {}", i2.as_usize());
        Ok(pt)
    }

    /// Map **one** 4 KiB page at `va → pa` with `flags`.
    ///
    /// # Errors
    /// - [`MemError::WrongAlignment`] if either address is not page aligned.
    /// - [`MemError::DoubleAlloc`] if `va` is already mapped.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<()> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MemError::WrongAlignment);
        }

        let pt = self.ensure_table(alloc, va)?;
        let i1 = L1Index::from(va);
        self.window.with_table(pt, |table| {
            if table.get(i1).is_present() {
                return Err(MemError::DoubleAlloc);
            }
            table.set(i1, PtEntry::make_4k(pa.page(), flags));
            Ok(())
        })?;

        log::trace!("Mapped {va} -> {pa}");
        Ok(())
    }

    /// Unmap a single **4 KiB** page at `va` and return the frame it mapped.
    ///
    /// The frame itself is not released; the page table stays in place.
    ///
    /// # Errors
    /// - [`MemError::WrongAlignment`] if `va` is not page aligned.
    /// - [`MemError::DoubleFree`] if nothing is mapped at `va`.
    pub fn unmap(&self, va: VirtualAddress) -> Result<PhysicalPage<Size4K>> {
        if !va.is_aligned::<Size4K>() {
            return Err(MemError::WrongAlignment);
        }

        let (i2, i1) = split_indices(va);
        let pt = self
            .window
            .with_directory(self.directory, |pd| pd.get(i2).next_table())
            .ok_or(MemError::DoubleFree)?;

        let frame = self.window.with_table(pt, |table| {
            let (frame, _) = table.get(i1).page_4k()?;
            table.set(i1, PtEntry::zero());
            Some(frame)
        });
        let frame = frame.ok_or(MemError::DoubleFree)?;

        // SAFETY: invlpg on a page that may not be cached is harmless.
        unsafe { kernel_registers::tlb::invalidate_page(VirtualPage::containing_address(va)) };

        log::trace!("Unmapped {va} (was {frame})");
        Ok(frame)
    }

    /// Whether a present translation exists for `va`.
    #[must_use]
    pub fn does_mapping_exist(&self, va: VirtualAddress) -> bool {
        self.query(va).is_some()
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    ///
    /// Handles 4 MiB leaves by adding the appropriate **in-page offset**.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i2, i1) = split_indices(va);
        match self.window.with_directory(self.directory, |pd| pd.get(i2).kind())? {
            PdEntryKind::Leaf4MiB(base, _) => Some(base.join(va.offset::<Size4M>())),
            PdEntryKind::NextPageTable(pt, _) => {
                let (base, _) = self.window.with_table(pt, |table| table.get(i1).page_4k())?;
                Some(base.join(va.offset::<Size4K>()))
            }
        }
    }

    /// Release the page tables of the user half and the directory frame.
    ///
    /// Frames mapped by those tables are owned by the caller and are not
    /// released. The space must not be active.
    ///
    /// # Errors
    /// Propagates failures of [`FrameAlloc::free_4k`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) -> Result<()> {
        let tables: [Option<PhysicalPage<Size4K>>; KERNEL_PDE_START] =
            self.window.with_directory(self.directory, |pd| {
                core::array::from_fn(|i| pd.get(L2Index::new(i as u16)).next_table())
            });

        for pt in tables.into_iter().flatten() {
            alloc.free_4k(pt)?;
        }
        alloc.free_4k(self.directory)?;

        log::debug!("Destroyed page directory at {}", self.directory);
        Ok(())
    }
}
