//! TLB maintenance.

use kernel_memory_addresses::{Size4K, VirtualPage};

/// Drop the TLB entry for one page of the active address space.
///
/// # Safety
/// Ring 0 only.
#[inline]
pub unsafe fn invalidate_page(page: VirtualPage<Size4K>) {
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) page.base().as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86")))]
    let _ = page;
}
