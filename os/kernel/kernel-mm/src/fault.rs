//! Page fault resolution for demand-committed regions.

use kernel_alloc::vmm::VasFlags;
use kernel_error::{MemError, Result};
use kernel_info::memory::KERNEL_BASE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::PhysMapper;

use crate::KernelMemory;
use crate::process::ProcessTable;

/// Commit the page behind a not-present fault at `addr`, raised while
/// `directory` was active.
///
/// Kernel addresses resolve against the kernel's regions, everything else
/// against the regions of the process owning `directory`.
///
/// # Errors
/// - [`MemError::InvalidArgument`] if no process owns `directory`.
/// - [`MemError::OutsideAddressableRange`] if no region covers `addr`.
/// - [`MemError::PageWrongState`] if the region is not committed on demand.
/// - [`MemError::DoubleAlloc`] if the page is already present (a protection
///   fault).
pub fn handle_page_fault<'a, M: PhysMapper, const N: usize>(
    kernel: &mut KernelMemory<'a, M>,
    processes: &mut ProcessTable<'a, N>,
    addr: VirtualAddress,
    directory: PhysicalPage<Size4K>,
) -> Result<PhysicalAddress> {
    log::debug!("Page fault at {addr} in {directory}");

    let mut vmm = if addr.as_u32() >= KERNEL_BASE {
        kernel.vmm()
    } else {
        let process = processes
            .by_directory_mut(directory)
            .ok_or(MemError::InvalidArgument)?;
        process.vmm(kernel)
    };

    let flags = vmm
        .list()
        .find(addr)
        .ok_or(MemError::OutsideAddressableRange)?
        .flags();
    if !flags.intersects(VasFlags::NOT_PRESENT | VasFlags::GROWABLE) {
        log::warn!("Fault at {addr} hit a region without demand paging");
        return Err(MemError::PageWrongState);
    }
    vmm.commit_page(addr)
}
