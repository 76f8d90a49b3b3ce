//! # Kernel Memory Subsystem
//!
//! Wires the allocators of `kernel-alloc` into the running kernel and offers
//! the process layer its view of memory.
//!
//! ## Boot sequence
//!
//! ```text
//! boot record ─► boot::init_frames   PMM, bitmaps from salloc
//!             ─► KernelMemory::new   adopt the boot directory
//!             ─► prepare_kernel_half one table per kernel PDE
//!             ─► init_heap           kmalloc over a kernel VMM region
//! ```
//!
//! Afterwards processes are created with [`ProcessMemory::create`] and
//! demand-paged regions are filled by [`handle_page_fault`].
//!
//! On the bare-metal target (`target_os = "none"`) the `global` module
//! keeps the state in one [`ExclusiveCell`](kernel_sync::ExclusiveCell) and
//! provides the panic handler. Everything else takes its state explicitly and
//! runs on the host against simulated RAM.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
mod fault;
mod kernel;
pub mod process;

#[cfg(all(target_os = "none", target_arch = "x86", feature = "asm"))]
pub mod global;

pub use fault::handle_page_fault;
pub use kernel::KernelMemory;
pub use process::{PROCESS_VAS_SLOTS, ProcessMemory, ProcessTable};

/// Region descriptors available to the kernel.
pub const KERNEL_VAS_SLOTS: usize = 256;

/// Shared mappings alive at once, across all processes.
pub const SHARE_SLOTS: usize = 64;

/// Processes tracked by the bare-metal glue.
pub const MAX_PROCESSES: usize = 32;
