//! # Memory Layout

/// Size of a page frame and of a virtual page, in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Entries in a page directory and in a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Where the kernel executes (VMA). Everything at or above belongs to the
/// kernel half and is shared by every page directory.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Where the boot loader places the kernel image in *physical* memory (LMA).
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Bytes of low physical memory mapped at [`KERNEL_BASE`] by the boot code.
pub const KERNEL_IMAGE_WINDOW: u32 = 0x0040_0000; // 4 MiB

/// First page directory entry of the kernel half.
pub const KERNEL_PDE_START: usize = (KERNEL_BASE >> 22) as usize;

/// Start of the kernel's dynamically managed virtual region (kernel heap,
/// page-allocation bitmaps, process metadata).
pub const KERNEL_LOW_REGION_START: u32 = KERNEL_BASE + KERNEL_IMAGE_WINDOW;

/// Kernel virtual page used as the temporary map window.
pub const TEMPORARY_MAP_ADDRESS: u32 = 0xFFBF_F000;

/// Exclusive end of the kernel's dynamically managed virtual region.
pub const KERNEL_LOW_REGION_END: u32 = TEMPORARY_MAP_ADDRESS;

/// Page directory entry that points back at the directory itself.
pub const RECURSIVE_ENTRY: usize = 1023;

/// Base of the 4 MiB window through which the recursive entry exposes every
/// page table of the active directory.
pub const RECURSIVE_TABLES_BASE: u32 = 0xFFC0_0000;

/// Virtual address of the active page directory through the recursive entry.
pub const RECURSIVE_DIRECTORY: u32 = 0xFFFF_F000;

/// Lowest virtual address handed out to a process.
pub const PROCESS_ADDR_SPACE_START: u32 = 0x0040_0000; // 4 MiB

/// Exclusive end of a process' virtual region.
pub const PROCESS_ADDR_SPACE_END: u32 = KERNEL_BASE;

/// Physical memory below this limit is reachable by the ISA DMA controller.
pub const DMA_LIMIT: u32 = 0x0100_0000; // 16 MiB

/// Bits per frame in a page allocation bitmap (free/used/reserved/invalid).
pub const PAB_BITS_PER_STATE: usize = 2;

/// Size of the static allocator's backing store.
pub const SALLOC_HEAP_SIZE: usize = 64 * 1024;

/// Pages reserved for the kernel's general-purpose heap.
pub const KMALLOC_HEAP_PAGES: u32 = 256; // 1 MiB

const _: () = {
    assert!(KERNEL_BASE.is_multiple_of(1 << 22));
    assert!(KERNEL_LOW_REGION_START < KERNEL_LOW_REGION_END);
    assert!(TEMPORARY_MAP_ADDRESS < RECURSIVE_TABLES_BASE);
    assert!(RECURSIVE_TABLES_BASE == (RECURSIVE_ENTRY as u32) << 22);
    assert!(RECURSIVE_DIRECTORY == RECURSIVE_TABLES_BASE | ((RECURSIVE_ENTRY as u32) << 12));
    assert!(PROCESS_ADDR_SPACE_START < PROCESS_ADDR_SPACE_END);
    assert!(8 % PAB_BITS_PER_STATE == 0);
    assert!(SALLOC_HEAP_SIZE.is_multiple_of(PAGE_SIZE as usize));
};
