//! # Temporary Window Backend
//!
//! [`PhysMapper`] for the running kernel. The window page
//! [`TEMPORARY_MAP_ADDRESS`] is backed by one PTE; that PTE is reached
//! through the recursive page directory entry, so changing what the window
//! shows is a single store plus an `invlpg`.
//!
//! ```text
//! RECURSIVE_TABLES_BASE + pd_index(window) × 4096 + pt_index(window) × 4
//!   └── PTE of the window ──► frame
//! ```
//!
//! The page table covering the window must exist before the first map; the
//! boot stub sets it up before handing over to the kernel.

use core::ptr::NonNull;
use kernel_info::memory::{RECURSIVE_TABLES_BASE, TEMPORARY_MAP_ADDRESS};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_registers::tlb;
use kernel_vmem::{PageEntryBits, PhysMapper};

const WINDOW: VirtualAddress = VirtualAddress::new(TEMPORARY_MAP_ADDRESS);

/// Address of the window's own PTE through the recursive mapping.
#[allow(clippy::cast_possible_truncation)]
const fn window_pte() -> u32 {
    RECURSIVE_TABLES_BASE + (WINDOW.directory_index() as u32) * 4096 + (WINDOW.table_index() as u32) * 4
}

/// The kernel's window backend; only valid while a directory with the
/// recursive entry is active.
#[derive(Debug, Default, Copy, Clone)]
pub struct RecursiveWindow;

impl RecursiveWindow {
    unsafe fn store(entry: PageEntryBits) {
        let slot = window_pte() as usize as *mut u32;
        unsafe {
            slot.write_volatile(entry.into_bits());
            tlb::invalidate_page(VirtualPage::<Size4K>::containing_address(WINDOW));
        }
    }
}

impl PhysMapper for RecursiveWindow {
    unsafe fn map_window(&self, frame: PhysicalPage<Size4K>) -> NonNull<u8> {
        let mut entry = PageEntryBits::new_kernel_rw();
        entry.set_physical_address(frame.base());
        unsafe {
            Self::store(entry);
            NonNull::new_unchecked(WINDOW.as_usize() as *mut u8)
        }
    }

    unsafe fn unmap_window(&self) {
        unsafe { Self::store(PageEntryBits::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_pte_is_last_slot_of_table_1022() {
        assert_eq!(WINDOW.directory_index(), 1022);
        assert_eq!(WINDOW.table_index(), 1023);
        assert_eq!(window_pte(), 0xFFFF_EFFC);
    }
}
