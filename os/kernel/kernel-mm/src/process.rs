//! # Process address spaces
//!
//! The part of the memory subsystem the process layer sees: one
//! [`ProcessMemory`] per process (a page directory and the process' region
//! list), and a [`ProcessTable`] to find them by ID or by directory.
//!
//! Region descriptors of a process live in a kmalloc block owned by the
//! process and released with it.

use core::fmt;
use core::ptr::NonNull;
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::vmm::{KERNEL_OWNER, Vas, VasFlags, VasList, Vmm};
use kernel_error::{MemError, Result};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::PhysMapper;

use crate::KernelMemory;

/// Region descriptors available to one process.
pub const PROCESS_VAS_SLOTS: usize = 64;

/// Memory owned by one process.
pub struct ProcessMemory<'a> {
    pid: u32,
    regions: VasList<'a>,
    /// kmalloc block holding the descriptors of `regions`.
    slots: NonNull<u8>,
}

impl<'a> ProcessMemory<'a> {
    /// A new, empty address space for `pid`.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] for the kernel's owner ID.
    /// - [`MemError::OutOfMemory`] if the kmalloc heap or the frames run out.
    pub fn create<M: PhysMapper>(kernel: &mut KernelMemory<'a, M>, pid: u32) -> Result<Self> {
        if pid == KERNEL_OWNER {
            return Err(MemError::InvalidArgument);
        }
        let (slots, mut array) = kernel.kmalloc_array::<Option<Vas>>(PROCESS_VAS_SLOTS, || None)?;
        // SAFETY: `slots` is private and only freed by `destroy`, which
        // consumes the list together with the process.
        let vas = unsafe { array.as_mut() };
        let directory = match kernel.create_address_space() {
            Ok(directory) => directory,
            Err(e) => {
                kernel.kfree(slots);
                return Err(e);
            }
        };

        log::info!("Created address space {directory} for process {pid}");
        Ok(Self {
            pid,
            regions: VasList::process(pid, directory, vas),
            slots,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Page directory to load into CR3 when the process runs.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.regions.directory()
    }

    #[must_use]
    pub const fn regions(&self) -> &VasList<'a> {
        &self.regions
    }

    pub const fn regions_mut(&mut self) -> &mut VasList<'a> {
        &mut self.regions
    }

    /// Virtual memory operations on this process' regions.
    pub fn vmm<'m, M: PhysMapper>(
        &'m mut self,
        kernel: &'m mut KernelMemory<'a, M>,
    ) -> Vmm<'m, 'a, M, BitmapFrameAlloc<'a>> {
        kernel.vmm_for(&mut self.regions)
    }

    /// Copy a flat program image into a fresh writable region and return
    /// its start.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] for an empty image.
    /// - [`MemError::OutOfMemory`] if no gap or frame is left.
    pub fn load<M: PhysMapper>(&mut self, kernel: &mut KernelMemory<'a, M>, image: &[u8]) -> Result<VirtualAddress> {
        if image.is_empty() {
            return Err(MemError::InvalidArgument);
        }
        let pages = u32::try_from(image.len().div_ceil(PAGE_SIZE as usize)).map_err(|_| MemError::InvalidRange)?;

        let window = kernel.window();
        let mut vmm = self.vmm(kernel);
        let start = vmm.alloc_pages(pages, VasFlags::WRITABLE | VasFlags::CACHE_ENABLED)?;
        for (i, chunk) in (0u32..).zip(image.chunks(PAGE_SIZE as usize)) {
            let pa = vmm
                .space()
                .query(start + i * PAGE_SIZE)
                .ok_or(MemError::PageWrongState)?;
            window.copy_into(PhysicalPage::containing_address(pa), 0, chunk);
        }

        log::debug!(
            "Loaded {} byte(s) for process {} at {start}",
            image.len(),
            self.pid
        );
        Ok(start)
    }

    /// Reserve a stack of `pages` that is committed on first touch. Returns
    /// the initial stack pointer (the end of the region).
    ///
    /// # Errors
    /// As [`Vmm::alloc_pages`].
    pub fn alloc_stack<M: PhysMapper>(&mut self, kernel: &mut KernelMemory<'a, M>, pages: u32) -> Result<VirtualAddress> {
        let flags = VasFlags::WRITABLE | VasFlags::CACHE_ENABLED | VasFlags::GROWABLE | VasFlags::NOT_PRESENT;
        let start = self.vmm(kernel).alloc_pages(pages, flags)?;
        start.checked_add(pages * PAGE_SIZE).ok_or(MemError::InvalidRange)
    }

    /// Release every region, the page directory and the descriptors.
    ///
    /// Shared frames survive while another region still references them.
    ///
    /// # Errors
    /// Propagates the first release failure; the process is then leaked.
    pub fn destroy<M: PhysMapper>(mut self, kernel: &mut KernelMemory<'a, M>) -> Result<()> {
        self.vmm(kernel).unreserve_all()?;
        kernel.destroy_address_space(self.directory())?;
        kernel.kfree(self.slots);

        log::info!("Destroyed address space of process {}", self.pid);
        Ok(())
    }
}

impl fmt::Debug for ProcessMemory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemory")
            .field("pid", &self.pid)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity table of live processes.
pub struct ProcessTable<'a, const N: usize> {
    entries: [Option<ProcessMemory<'a>>; N],
}

impl<const N: usize> Default for ProcessTable<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> ProcessTable<'a, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [const { None }; N],
        }
    }

    /// Track `process`.
    ///
    /// # Errors
    /// - [`MemError::DoubleAlloc`] if its ID is already present.
    /// - [`MemError::OutOfMemory`] if the table is full; the process is
    ///   handed back.
    pub fn insert(&mut self, process: ProcessMemory<'a>) -> core::result::Result<(), (MemError, ProcessMemory<'a>)> {
        if self.get(process.pid).is_some() {
            return Err((MemError::DoubleAlloc, process));
        }
        match self.entries.iter_mut().find(|e| e.is_none()) {
            Some(slot) => {
                *slot = Some(process);
                Ok(())
            }
            None => Err((MemError::OutOfMemory, process)),
        }
    }

    #[must_use]
    pub fn get(&self, pid: u32) -> Option<&ProcessMemory<'a>> {
        self.iter().find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut ProcessMemory<'a>> {
        self.entries.iter_mut().flatten().find(|p| p.pid == pid)
    }

    /// The process whose page directory is `directory`.
    pub fn by_directory_mut(&mut self, directory: PhysicalPage<Size4K>) -> Option<&mut ProcessMemory<'a>> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|p| p.directory() == directory)
    }

    pub fn remove(&mut self, pid: u32) -> Option<ProcessMemory<'a>> {
        self.entries
            .iter_mut()
            .find(|e| e.as_ref().is_some_and(|p| p.pid == pid))
            .and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessMemory<'a>> + '_ {
        self.entries.iter().flatten()
    }
}
