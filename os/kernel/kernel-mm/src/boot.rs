//! # Physical memory bring-up
//!
//! Turns the boot loader's memory map into the physical memory manager:
//! regions are laid out around the DMA limit and their allocation bitmaps are
//! carved out of the static heap, since nothing else can allocate yet.

use kernel_alloc::frame_alloc::{BitmapFrameAlloc, RegionConfig, RegionKind, pab_size};
use kernel_alloc::static_heap::{self, StaticHeap};
use kernel_error::{MemError, Result};
use kernel_info::boot::{BootInfo, LoadedFile, MemoryMapEntry, RawBootInfo};
use kernel_info::memory::{DMA_LIMIT, KERNEL_BASE, PAB_BITS_PER_STATE};
use kernel_memory_addresses::PhysicalAddress;

/// Highest physical address a 32-bit frame number can describe.
const ADDRESSABLE: u64 = 1 << 32;

/// One physical region to be managed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionPlan {
    pub kind: RegionKind,
    pub start: PhysicalAddress,
    pub length: u64,
}

/// Split installed memory into a DMA region below [`DMA_LIMIT`] and, if
/// there is more, a non-DMA region above it.
#[must_use]
pub fn plan_regions(installed: u64) -> [Option<RegionPlan>; 2] {
    let installed = installed.min(ADDRESSABLE);
    let dma_end = installed.min(u64::from(DMA_LIMIT));
    let dma = (dma_end > 0).then_some(RegionPlan {
        kind: RegionKind::Dma,
        start: PhysicalAddress::zero(),
        length: dma_end,
    });
    let rest = (installed > dma_end).then_some(RegionPlan {
        kind: RegionKind::NonDma,
        start: PhysicalAddress::new(DMA_LIMIT),
        length: installed - dma_end,
    });
    [dma, rest]
}

/// Build the physical memory manager for `boot`, taking its bitmaps from
/// `salloc`.
///
/// When the static heap cannot hold a full bitmap, the last region is only
/// tracked as far as the bitmap reaches.
///
/// # Errors
/// - [`MemError::InvalidArgument`] if the memory map has no available memory.
/// - [`MemError::OutOfMemory`] if not even a minimal bitmap fits.
pub fn init_frames<'a, const N: usize>(
    boot: &BootInfo<'_>,
    salloc: &'a mut StaticHeap<N>,
) -> Result<BitmapFrameAlloc<'a>> {
    let plans = plan_regions(boot.installed_ram());
    if plans.iter().all(Option::is_none) {
        return Err(MemError::InvalidArgument);
    }

    let mut configs: [Option<RegionConfig<'a>>; 2] = [None, None];
    for (slot, plan) in configs.iter_mut().zip(plans) {
        let Some(plan) = plan else { continue };
        let wanted = pab_size(plan.length, PAB_BITS_PER_STATE);
        let available = salloc.free_memory().saturating_sub(2 * static_heap::HEADER_SIZE);
        let bytes = wanted.min(available);
        if bytes < wanted {
            log::warn!(
                "Static heap holds {bytes} of {wanted} bitmap bytes for {:?} memory",
                plan.kind
            );
        }
        if bytes == 0 {
            return Err(MemError::OutOfMemory);
        }
        let ptr = salloc.alloc_zeroed(bytes)?;
        // SAFETY: the block is `bytes` long, zeroed, and never freed; `salloc`
        // stays mutably borrowed for 'a so nothing else can reach it.
        let pab: &'a mut [u8] = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), bytes) };
        *slot = Some(RegionConfig {
            kind: plan.kind,
            start: plan.start,
            length: plan.length,
            pab,
            bits_per_state: PAB_BITS_PER_STATE,
        });
    }

    let mut frames = BitmapFrameAlloc::new();
    frames.init(boot, configs.into_iter().flatten())?;
    Ok(frames)
}

/// View the boot loader's record through the kernel's mirror of low memory.
///
/// # Safety
/// Every pointer in `raw` must be a physical address inside the low memory
/// the boot stub maps at [`KERNEL_BASE`], and the arrays must stay untouched
/// for `'a`.
#[must_use]
pub unsafe fn boot_info_from_raw<'a>(raw: &RawBootInfo) -> BootInfo<'a> {
    let map = { raw.memory_map_ptr } as usize + KERNEL_BASE as usize;
    let files = { raw.files_ptr } as usize + KERNEL_BASE as usize;
    unsafe {
        BootInfo {
            memory_map: core::slice::from_raw_parts(
                map as *const MemoryMapEntry,
                { raw.memory_map_count } as usize,
            ),
            files: core::slice::from_raw_parts(files as *const LoadedFile, { raw.files_count } as usize),
            kernel_image: raw.kernel_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::frame_alloc::{FREE, RESERVED};
    use kernel_info::boot::MemoryKind;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn small_machines_only_have_dma_memory() {
        let [dma, rest] = plan_regions(8 * MIB);
        assert_eq!(
            dma,
            Some(RegionPlan {
                kind: RegionKind::Dma,
                start: PhysicalAddress::zero(),
                length: 8 * MIB
            })
        );
        assert_eq!(rest, None);
    }

    #[test]
    fn memory_above_the_dma_limit_gets_its_own_region() {
        let [dma, rest] = plan_regions(64 * MIB);
        assert_eq!(dma.unwrap().length, 16 * MIB);
        let rest = rest.unwrap();
        assert_eq!(rest.kind, RegionKind::NonDma);
        assert_eq!(rest.start, PhysicalAddress::new(DMA_LIMIT));
        assert_eq!(rest.length, 48 * MIB);
    }

    #[test]
    fn nothing_installed() {
        assert_eq!(plan_regions(0), [None, None]);
    }

    #[test]
    fn bitmaps_come_from_the_static_heap() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Available),
            MemoryMapEntry::new(0x10_0000, 31 * MIB, MemoryKind::Available),
        ];
        let boot = BootInfo {
            memory_map: &map,
            files: &[],
            kernel_image: LoadedFile::new(0x10_0000, 0x4_0000),
        };
        let mut salloc = Box::new(StaticHeap::<8192>::new());
        let frames = init_frames(&boot, &mut salloc).unwrap();

        let regions: Vec<_> = frames.regions().collect();
        assert_eq!(regions.len(), 2);
        // 4096 frames at 2 bits each.
        assert_eq!(regions[0].pab().len(), 1024);
        assert_eq!(regions[1].pab().len(), 1024);
        // Hole between 636 KiB and 1 MiB, then the kernel image.
        assert_eq!(regions[0].frame_state(0x9E), FREE);
        assert_eq!(regions[0].frame_state(0x9F), RESERVED);
        assert_eq!(regions[0].frame_state(0x100), RESERVED);
        assert_eq!(regions[0].frame_state(0x13F), RESERVED);
        assert_eq!(regions[0].frame_state(0x140), FREE);
    }

    #[test]
    fn oversized_memory_is_clipped_to_the_bitmap() {
        let map = [MemoryMapEntry::new(0, 512 * MIB, MemoryKind::Available)];
        let boot = BootInfo {
            memory_map: &map,
            files: &[],
            kernel_image: LoadedFile::new(0x10_0000, 0x1000),
        };
        let mut salloc = Box::new(StaticHeap::<4096>::new());
        let frames = init_frames(&boot, &mut salloc).unwrap();
        let non_dma = frames.regions().nth(1).unwrap();
        assert!(non_dma.usable_frames() < (496 * MIB / 4096) as usize);
    }
}
