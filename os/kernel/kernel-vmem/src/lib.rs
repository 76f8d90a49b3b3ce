//! # Virtual Memory Support
//!
//! Two-level x86 paging (no PAE) for the kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] describing one page directory and the page tables
//!   hanging off it: map, unmap, query, creation and teardown.
//! - Typed page [`PageDirectory`]/[`PageTable`] frames with bitfield entries
//!   ([`PageEntryBits`]).
//! - A [`TemporaryWindow`]: one kernel page through which any physical frame
//!   can be read or written. Page tables are never accessed any other way.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD ──► PDE (PS=0) → PT ──► PTE → 4 KiB page
//!            └► PDE (PS=1) ────────────► 4 MiB page
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by CR3. Entries 768 and up are the kernel half and are shared. Entry 1023 points back at the directory. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page. |
//!
//! ## Single window discipline
//!
//! Every access to a page table frame goes through the [`TemporaryWindow`],
//! which holds at most one frame at a time. Operations are sequenced so the
//! window is never requested while it is held; mapping twice, or unmapping an
//! idle window, stops the kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
pub mod page_table;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod temporary_map;

pub use crate::address_space::{AddressSpace, DirectoryFlags};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{L2Index, PageDirectory, PdEntry, PdEntryKind};
pub use crate::page_table::pt::{L1Index, PageTable, PtEntry};
pub use crate::temporary_map::TemporaryWindow;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use core::ptr::NonNull;
use kernel_error::Result;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames for page tables and page directories.
///
/// Returned frames **must** be 4 KiB aligned. `None` means out of memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// Implementation specific; the physical memory manager rejects frames
    /// outside its region.
    fn free_4k(&mut self, page: PhysicalPage<Size4K>) -> Result<()>;
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &mut T {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, page: PhysicalPage<Size4K>) -> Result<()> {
        (**self).free_4k(page)
    }
}

/// Backend of the [`TemporaryWindow`]: makes one physical frame visible at a
/// fixed kernel virtual page.
///
/// In the kernel this rewrites the PTE behind
/// [`TEMPORARY_MAP_ADDRESS`](kernel_info::memory::TEMPORARY_MAP_ADDRESS) and
/// invalidates it; host tests back it with plain memory.
pub trait PhysMapper {
    /// Point the window at `frame` and return the window's address.
    ///
    /// # Safety
    /// The returned pointer is valid for 4096 bytes until the next call to
    /// [`unmap_window`](Self::unmap_window). Callers must not hold two
    /// windows at once; [`TemporaryWindow`] enforces this.
    unsafe fn map_window(&self, frame: PhysicalPage<Size4K>) -> NonNull<u8>;

    /// Detach the window.
    ///
    /// # Safety
    /// No pointer obtained from [`map_window`](Self::map_window) may be used
    /// afterwards.
    unsafe fn unmap_window(&self);
}

impl<T: PhysMapper + ?Sized> PhysMapper for &T {
    #[inline]
    unsafe fn map_window(&self, frame: PhysicalPage<Size4K>) -> NonNull<u8> {
        unsafe { (**self).map_window(frame) }
    }

    #[inline]
    unsafe fn unmap_window(&self) {
        unsafe { (**self).unmap_window() }
    }
}
