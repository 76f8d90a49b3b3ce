//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The allocators of the memory subsystem, from the first boot-time bytes to
//! per-process virtual regions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          kmalloc heap ([`free_list`])               │
//! │    • first fit, split on alloc, coalesce on free    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ region reserved through
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Virtual Memory Manager ([`vmm`])             │
//! │    • ordered VAS lists per owner                    │
//! │    • commit now or on page fault                    │
//! │    • shared mappings with reference counts          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames from
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Physical Memory Manager ([`frame_alloc`])      │
//! │    • one page allocation bitmap per region          │
//! │    • DMA / non-DMA regions                          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ bitmaps stored in
//! ┌─────────────────▼───────────────────────────────────┐
//! │          salloc heap ([`static_heap`])              │
//! │    • fixed buffer inside the kernel image           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables are only ever touched through the temporary map window; in
//! the running kernel [`phys_mapper::RecursiveWindow`] backs it.
//!
//! ## Kernel virtual layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  unmapped                       │
//! 0x0040_0000 ├─────────────────────────────────┤ PROCESS_ADDR_SPACE_START
//!             │  process regions                │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_BASE
//!             │  kernel image (4 MiB)           │
//! 0xC040_0000 ├─────────────────────────────────┤ KERNEL_LOW_REGION_START
//!             │  kernel regions (kmalloc, ...)  │
//! 0xFFBF_F000 ├─────────────────────────────────┤ TEMPORARY_MAP_ADDRESS
//!             │  temporary map window           │
//! 0xFFC0_0000 ├─────────────────────────────────┤ RECURSIVE_TABLES_BASE
//!             │  page tables (recursive entry)  │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core::ptr::NonNull;
//! use kernel_alloc::free_list::FreeListHeap;
//!
//! let mut backing = vec![0u8; 4096];
//! let mut heap = FreeListHeap::new();
//! unsafe { heap.init(NonNull::new(backing.as_mut_ptr()).unwrap(), backing.len()) }.unwrap();
//!
//! let p = heap.alloc(100).unwrap();
//! heap.free(p);
//! assert_eq!(heap.free_memory(), 4096);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod free_list;
pub mod phys_mapper;
pub mod static_heap;
pub mod vmm;
