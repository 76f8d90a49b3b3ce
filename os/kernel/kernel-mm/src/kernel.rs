//! # Kernel memory state
//!
//! Everything the memory subsystem owns, as one explicit value: the physical
//! memory manager, the kernel's region list, the share pool and the kmalloc
//! heap. Only the bare-metal glue keeps it in a global.

use core::ptr::NonNull;
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::free_list::FreeListHeap;
use kernel_alloc::vmm::{MemoryShare, SharePool, Vas, VasFlags, VasList, Vmm};
use kernel_error::{MemError, Result};
use kernel_info::memory::{KERNEL_PDE_START, KMALLOC_HEAP_PAGES, PAGE_SIZE, RECURSIVE_ENTRY};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, DirectoryFlags, L2Index, PhysMapper, TemporaryWindow};

/// The memory subsystem after boot.
pub struct KernelMemory<'a, M: PhysMapper> {
    window: &'a TemporaryWindow<M>,
    frames: BitmapFrameAlloc<'a>,
    shares: SharePool<'a>,
    regions: VasList<'a>,
    heap: FreeListHeap,
}

impl<'a, M: PhysMapper> KernelMemory<'a, M> {
    /// Adopt `directory` as the kernel's address space.
    ///
    /// The kmalloc heap stays empty until [`init_heap`](Self::init_heap).
    pub fn new(
        window: &'a TemporaryWindow<M>,
        frames: BitmapFrameAlloc<'a>,
        directory: PhysicalPage<Size4K>,
        vas_slots: &'a mut [Option<Vas>],
        share_slots: &'a mut [Option<MemoryShare>],
    ) -> Self {
        Self {
            window,
            frames,
            shares: SharePool::new(share_slots),
            regions: VasList::kernel(directory, vas_slots),
            heap: FreeListHeap::new(),
        }
    }

    #[must_use]
    pub const fn window(&self) -> &'a TemporaryWindow<M> {
        self.window
    }

    /// The kernel's page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.regions.directory()
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'a> {
        &self.frames
    }

    #[must_use]
    pub const fn regions(&self) -> &VasList<'a> {
        &self.regions
    }

    #[must_use]
    pub const fn heap(&self) -> &FreeListHeap {
        &self.heap
    }

    #[must_use]
    pub const fn shares(&self) -> &SharePool<'a> {
        &self.shares
    }

    /// Give every kernel directory entry a page table.
    ///
    /// Process directories copy the kernel entries once, at creation; tables
    /// linked later would not show up there. Entries mapped by a 4 MiB page
    /// are left alone.
    ///
    /// # Errors
    /// None in practice; running out of frames for a table is fatal.
    pub fn prepare_kernel_half(&mut self) -> Result<()> {
        let space = AddressSpace::from_directory(self.window, self.directory());
        let mut created = 0;
        for entry in KERNEL_PDE_START..RECURSIVE_ENTRY {
            let va = VirtualAddress::from_indices(entry, 0);
            let present = self
                .window
                .with_directory(space.directory(), |pd| pd.get(L2Index::from(va)).is_present());
            if !present {
                space.ensure_table(&mut self.frames, va)?;
                created += 1;
            }
        }
        log::debug!("Allocated {created} kernel page table(s)");
        Ok(())
    }

    /// Virtual memory operations on the kernel's own regions.
    pub fn vmm(&mut self) -> Vmm<'_, 'a, M, BitmapFrameAlloc<'a>> {
        Vmm::new(self.window, &mut self.frames, &mut self.shares, &mut self.regions)
    }

    /// Virtual memory operations on another owner's regions.
    pub fn vmm_for<'m>(&'m mut self, list: &'m mut VasList<'a>) -> Vmm<'m, 'a, M, BitmapFrameAlloc<'a>> {
        Vmm::new(self.window, &mut self.frames, &mut self.shares, list)
    }

    /// Share the committed region at `start` of `from` with `to`. Either
    /// list may be `None` for the kernel.
    ///
    /// # Errors
    /// As [`Vmm::share_mapping`]; [`MemError::InvalidArgument`] when both
    /// sides are the kernel.
    pub fn share(
        &mut self,
        from: Option<&mut VasList<'a>>,
        start: VirtualAddress,
        count: u32,
        to: Option<&mut VasList<'a>>,
    ) -> Result<VirtualAddress> {
        match (from, to) {
            (Some(from), Some(to)) => self.vmm_for(from).share_mapping(start, count, to),
            (Some(from), None) => {
                let Self {
                    window,
                    frames,
                    shares,
                    regions,
                    ..
                } = self;
                Vmm::new(*window, frames, shares, from).share_mapping(start, count, regions)
            }
            (None, Some(to)) => self.vmm().share_mapping(start, count, to),
            (None, None) => Err(MemError::InvalidArgument),
        }
    }

    /// A fresh process directory sharing the kernel half.
    ///
    /// # Errors
    /// [`MemError::OutOfMemory`] if no frame is left.
    pub fn create_address_space(&mut self) -> Result<PhysicalPage<Size4K>> {
        let template = self.directory();
        let space = AddressSpace::create(
            self.window,
            &mut self.frames,
            DirectoryFlags::COPY_KERNEL | DirectoryFlags::RECURSIVE,
            Some(template),
        )?;
        Ok(space.directory())
    }

    /// Release a process directory and its user page tables.
    ///
    /// # Errors
    /// Propagates frame release failures.
    pub fn destroy_address_space(&mut self, directory: PhysicalPage<Size4K>) -> Result<()> {
        AddressSpace::from_directory(self.window, directory).destroy(&mut self.frames)
    }

    /// Reserve and commit the kmalloc region and set the heap up in it.
    ///
    /// # Errors
    /// Propagates the reservation failure.
    ///
    /// # Safety
    /// The kernel directory must be the active one, so the returned region
    /// is reachable at its virtual address.
    pub unsafe fn init_heap(&mut self) -> Result<VirtualAddress> {
        let flags = VasFlags::KERNEL | VasFlags::WRITABLE | VasFlags::CACHE_ENABLED;
        let start = self.vmm().alloc_pages(KMALLOC_HEAP_PAGES, flags)?;
        let base = NonNull::new(start.as_usize() as *mut u8).ok_or(MemError::InvalidRange)?;
        unsafe { self.init_heap_at(base, (KMALLOC_HEAP_PAGES * PAGE_SIZE) as usize)? };
        log::info!(
            "kmalloc heap: {} KiB at {start}",
            KMALLOC_HEAP_PAGES * PAGE_SIZE / 1024
        );
        Ok(start)
    }

    /// Set the kmalloc heap up over memory the caller provides.
    ///
    /// # Errors
    /// As [`FreeListHeap::init`].
    ///
    /// # Safety
    /// As [`FreeListHeap::init`].
    pub unsafe fn init_heap_at(&mut self, base: NonNull<u8>, size: usize) -> Result<()> {
        unsafe { self.heap.init(base, size) }
    }

    /// # Errors
    /// As [`FreeListHeap::alloc`].
    pub fn kmalloc(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        self.heap.alloc(bytes)
    }

    /// # Errors
    /// As [`FreeListHeap::alloc_zeroed`].
    pub fn kzalloc(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        self.heap.alloc_zeroed(bytes)
    }

    /// Release a kmalloc block; an unknown pointer stops the kernel.
    #[track_caller]
    pub fn kfree(&mut self, ptr: NonNull<u8>) {
        self.heap.free(ptr);
    }

    /// `count` values of `T` from the kmalloc heap, each set to `init()`.
    ///
    /// Returns the block to hand back to [`kfree`](Self::kfree) and the
    /// aligned, initialized array inside it. The array pointer is valid
    /// until the block is freed.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if `count` is zero.
    /// - [`MemError::OutOfMemory`] if the heap is exhausted.
    pub fn kmalloc_array<T>(
        &mut self,
        count: usize,
        init: impl Fn() -> T,
    ) -> Result<(NonNull<u8>, NonNull<[T]>)> {
        if count == 0 {
            return Err(MemError::InvalidArgument);
        }
        let bytes = size_of::<T>()
            .checked_mul(count)
            .and_then(|b| b.checked_add(align_of::<T>() - 1))
            .ok_or(MemError::OutOfMemory)?;
        let block = self.heap.alloc(bytes)?;
        let offset = block.as_ptr().align_offset(align_of::<T>());
        // SAFETY: `offset < align_of::<T>()`, so `count` values fit after it.
        let first = unsafe { block.add(offset) }.cast::<T>();
        for i in 0..count {
            unsafe { first.add(i).write(init()) };
        }
        Ok((block, NonNull::slice_from_raw_parts(first, count)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kernel_alloc::frame_alloc::{RegionConfig, RegionKind};
    use kernel_info::boot::{BootInfo, LoadedFile, MemoryKind, MemoryMapEntry};
    use kernel_info::memory::KERNEL_LOW_REGION_START;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::sim::SimulatedRam;

    pub const FRAMES: usize = 512;

    /// Host storage behind a simulated kernel.
    pub struct Storage {
        pab: Vec<u8>,
        vas: Vec<Option<Vas>>,
        shares: Vec<Option<MemoryShare>>,
        heap: Vec<u8>,
    }

    impl Storage {
        pub fn new() -> Self {
            Self {
                pab: vec![0; FRAMES / 4],
                vas: vec![None; 32],
                shares: vec![None; 8],
                heap: vec![0; 16 * 1024],
            }
        }
    }

    /// Boot over `FRAMES` frames of simulated RAM, all available, with the
    /// kmalloc heap on the host.
    pub fn boot<'a>(
        window: &'a TemporaryWindow<&'a SimulatedRam>,
        storage: &'a mut Storage,
    ) -> KernelMemory<'a, &'a SimulatedRam> {
        let map = [MemoryMapEntry::new(0, (FRAMES * 4096) as u64, MemoryKind::Available)];
        let boot = BootInfo {
            memory_map: &map,
            files: &[],
            kernel_image: LoadedFile::new(0, 0),
        };
        let mut frames = BitmapFrameAlloc::new();
        frames
            .init(
                &boot,
                [RegionConfig {
                    kind: RegionKind::Any,
                    start: PhysicalAddress::zero(),
                    length: (FRAMES * 4096) as u64,
                    pab: &mut storage.pab,
                    bits_per_state: 2,
                }],
            )
            .unwrap();
        let directory = AddressSpace::create(window, &mut frames, DirectoryFlags::RECURSIVE, None)
            .unwrap()
            .directory();

        let mut kernel = KernelMemory::new(window, frames, directory, &mut storage.vas, &mut storage.shares);
        let heap = NonNull::new(storage.heap.as_mut_ptr()).unwrap();
        unsafe { kernel.init_heap_at(heap, storage.heap.len()) }.unwrap();
        kernel
    }

    #[test]
    fn kernel_half_gets_every_table() {
        let ram = SimulatedRam::with_frames(FRAMES);
        let window = TemporaryWindow::new(&ram);
        let mut storage = Storage::new();
        let mut kernel = boot(&window, &mut storage);

        let free_before = kernel.frames().free_memory_size(RegionKind::Any);
        kernel.prepare_kernel_half().unwrap();
        let tables = (RECURSIVE_ENTRY - KERNEL_PDE_START) as u64;
        assert_eq!(kernel.frames().free_memory_size(RegionKind::Any), free_before - tables * 4096);

        // Idempotent.
        kernel.prepare_kernel_half().unwrap();
        assert_eq!(kernel.frames().free_memory_size(RegionKind::Any), free_before - tables * 4096);
    }

    #[test]
    fn kernel_regions_start_at_the_low_region() {
        let ram = SimulatedRam::with_frames(FRAMES);
        let window = TemporaryWindow::new(&ram);
        let mut storage = Storage::new();
        let mut kernel = boot(&window, &mut storage);

        let va = kernel.vmm().alloc_pages(2, VasFlags::WRITABLE).unwrap();
        assert_eq!(va.as_u32(), KERNEL_LOW_REGION_START);
        let vas = kernel.regions().find(va).unwrap();
        assert!(vas.flags().contains(VasFlags::KERNEL));
        assert_eq!(vas.allocated_pages(), 2);
    }

    #[test]
    fn arrays_from_kmalloc_are_aligned() {
        let ram = SimulatedRam::with_frames(FRAMES);
        let window = TemporaryWindow::new(&ram);
        let mut storage = Storage::new();
        let mut kernel = boot(&window, &mut storage);

        // Misalign the heap cursor first.
        let _pad = kernel.kmalloc(3).unwrap();
        let (block, array) = kernel.kmalloc_array::<u32>(10, || 7).unwrap();
        assert_eq!(array.cast::<u32>().as_ptr() as usize % align_of::<u32>(), 0);
        assert_eq!(array.len(), 10);
        assert!(unsafe { array.as_ref() }.iter().all(|&v| v == 7));
        let used = kernel.heap().used_memory();
        kernel.kfree(block);
        assert!(kernel.heap().used_memory() < used);
        assert_eq!(kernel.kmalloc_array::<u32>(0, || 0).err(), Some(MemError::InvalidArgument));
    }

    #[test]
    fn freed_array_blocks_are_handed_out_again() {
        let ram = SimulatedRam::with_frames(FRAMES);
        let window = TemporaryWindow::new(&ram);
        let mut storage = Storage::new();
        let mut kernel = boot(&window, &mut storage);

        let before = kernel.heap().used_memory();
        let (block, array) = kernel.kmalloc_array::<u64>(4, || u64::MAX).unwrap();
        let bytes = array.len() * size_of::<u64>() + align_of::<u64>() - 1;
        kernel.kfree(block);
        assert_eq!(kernel.heap().used_memory(), before);

        // The next caller gets the same block, zeroed.
        let other = kernel.kzalloc(bytes).unwrap();
        assert_eq!(other, block);
        let contents = unsafe { core::slice::from_raw_parts(other.as_ptr(), bytes) };
        assert!(contents.iter().all(|&b| b == 0));
        kernel.kfree(other);
    }
}
