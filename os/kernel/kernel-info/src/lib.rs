//! # Kernel Configuration and Boot Interface
//!
//! This crate holds the memory layout constants and the boot loader hand-off
//! record shared by the physical allocator, the paging layer and the kernel
//! heaps. It is the single source of truth for where things live.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Hand-off record**: a packed [`RawBootInfo`](boot::RawBootInfo) carrying
//!   the BIOS memory map and the locations of loaded files
//! * **Borrowed view**: [`BootInfo`](boot::BootInfo) answers the questions the
//!   physical allocator asks (installed RAM, availability of a range)
//!
//! ### Memory Layout ([`memory`])
//! Page size, table geometry and the virtual address space split.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit, two-level paging):
//!
//! 0x0000_0000             ┌─────────────────────────────────┐
//!                         │   unmapped (null guard)         │
//! PROCESS_ADDR_SPACE_START├─────────────────────────────────┤ 0x0040_0000
//!                         │   Process image, heap, stacks   │
//! KERNEL_BASE             ├─────────────────────────────────┤ 0xC000_0000
//!                         │   Kernel image (low 4 MiB)      │
//! KERNEL_LOW_REGION_START ├─────────────────────────────────┤ 0xC040_0000
//!                         │   Kernel dynamic region         │
//! TEMPORARY_MAP_ADDRESS   ├─────────────────────────────────┤ 0xFFBF_F000
//!                         │   Temporary map window (1 page) │
//! RECURSIVE_TABLES_BASE   ├─────────────────────────────────┤ 0xFFC0_0000
//!                         │   Page tables via PDE 1023      │
//! RECURSIVE_DIRECTORY     ├─────────────────────────────────┤ 0xFFFF_F000
//!                         │   Page directory via PDE 1023   │
//! 0xFFFF_FFFF             └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Low Memory (< 1 MiB)           │  frame 0 is never handed out
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │  Kernel Image                   │
//!             ├─────────────────────────────────┤
//!             │  Available RAM                  │
//! DMA_LIMIT   ├ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┤ 0x0100_0000 (16 MiB)
//!             │  Available RAM                  │
//!             └─────────────────────────────────┘
//! ```
//!
//! All layout constants are checked against each other at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
