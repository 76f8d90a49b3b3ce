//! # Bare-metal glue
//!
//! The one place the memory subsystem lives in globals: the kernel binary
//! calls [`init`] once from its entry point and the functions below from
//! the syscall and fault paths.
//!
//! ```text
//! static SALLOC ─► PMM bitmaps
//! static KERNEL_VAS / SHARES ─► kernel region list, share pool
//! MEMORY: ExclusiveCell<Option<Memory>>
//!   ├── KernelMemory  (PMM, kernel VMM, kmalloc)
//!   └── ProcessTable  (one ProcessMemory per process)
//! ```

use core::ptr::NonNull;
use kernel_alloc::frame_alloc::RegionKind;
use kernel_alloc::phys_mapper::RecursiveWindow;
use kernel_alloc::static_heap::StaticHeap;
use kernel_alloc::vmm::{MemoryShare, Vas};
use kernel_error::{Fatal, MemError, Result, fatal};
use kernel_info::boot::RawBootInfo;
use kernel_info::memory::SALLOC_HEAP_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_qemu::QemuLogger;
use kernel_sync::ExclusiveCell;
use kernel_vmem::{AddressSpace, TemporaryWindow};
use log::LevelFilter;

use crate::boot::{boot_info_from_raw, init_frames};
use crate::process::{ProcessMemory, ProcessTable};
use crate::{KERNEL_VAS_SLOTS, KernelMemory, MAX_PROCESSES, SHARE_SLOTS, handle_page_fault};

/// The window is only touched with `MEMORY` entered.
struct SharedWindow(TemporaryWindow<RecursiveWindow>);

// Safety: single CPU; every user holds the `MEMORY` guard.
unsafe impl Sync for SharedWindow {}

struct Memory {
    kernel: KernelMemory<'static, RecursiveWindow>,
    processes: ProcessTable<'static, MAX_PROCESSES>,
}

// Safety: the raw heap pointers and the window are only reached through
// `MEMORY`, on one CPU.
unsafe impl Send for Memory {}

static LOGGER: QemuLogger = QemuLogger::new(if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
});

static WINDOW: SharedWindow = SharedWindow(TemporaryWindow::new(RecursiveWindow));

#[unsafe(link_section = ".bss.salloc")]
static mut SALLOC: StaticHeap<SALLOC_HEAP_SIZE> = StaticHeap::new();

static mut KERNEL_VAS: [Option<Vas>; KERNEL_VAS_SLOTS] = [None; KERNEL_VAS_SLOTS];

static mut SHARES: [Option<MemoryShare>; SHARE_SLOTS] = [const { None }; SHARE_SLOTS];

static MEMORY: ExclusiveCell<Option<Memory>> = ExclusiveCell::new(None);

/// Bring the memory subsystem up.
///
/// Builds the PMM from the boot record, adopts the active page directory as
/// the kernel's, gives every kernel directory entry a table and sets up the
/// kmalloc heap.
///
/// # Errors
/// Propagates the first failure; the kernel cannot continue after one.
///
/// # Safety
/// - Call once, with interrupts off.
/// - `boot_info` must be the boot loader's record, reachable through the
///   low-memory mirror at the kernel base.
/// - The active directory must carry the recursive entry and a page table
///   for the temporary window.
pub unsafe fn init(boot_info: *const RawBootInfo) -> Result<()> {
    kernel_qemu::qemu_trace!("kernel-mm: init\n");
    // A second init is caught below; the logger only reports the first.
    let _ = LOGGER.init();

    let mut memory = MEMORY.enter();
    if memory.is_some() {
        fatal(Fatal::PmmAlreadyInitialized);
    }

    let info = unsafe { boot_info.read_unaligned() };
    let boot = unsafe { boot_info_from_raw(&info) };
    // SAFETY: guarded by the check above, these borrows are created once.
    let (salloc, vas, shares) = unsafe {
        (
            &mut *(&raw mut SALLOC),
            &mut *(&raw mut KERNEL_VAS),
            &mut *(&raw mut SHARES),
        )
    };
    let frames = init_frames(&boot, salloc)?;
    let directory = unsafe { AddressSpace::from_current(&WINDOW.0) }.directory();

    let mut kernel = KernelMemory::new(&WINDOW.0, frames, directory, vas, shares);
    kernel.prepare_kernel_half()?;
    unsafe { kernel.init_heap()? };

    log::info!(
        "Memory subsystem up: kernel directory {directory}, {} KiB free",
        kernel.frames().free_memory_size(RegionKind::Any) / 1024
    );
    *memory = Some(Memory {
        kernel,
        processes: ProcessTable::new(),
    });
    Ok(())
}

#[track_caller]
fn with_memory<R>(f: impl FnOnce(&mut Memory) -> R) -> R {
    MEMORY.with(|memory| match memory {
        Some(memory) => f(memory),
        None => fatal(Fatal::PmmNotInitialized),
    })
}

/// # Errors
/// As [`KernelMemory::kmalloc`].
pub fn kmalloc(bytes: usize) -> Result<NonNull<u8>> {
    with_memory(|m| m.kernel.kmalloc(bytes))
}

/// # Errors
/// As [`KernelMemory::kzalloc`].
pub fn kzalloc(bytes: usize) -> Result<NonNull<u8>> {
    with_memory(|m| m.kernel.kzalloc(bytes))
}

#[track_caller]
pub fn kfree(ptr: NonNull<u8>) {
    with_memory(|m| m.kernel.kfree(ptr));
}

/// Create and track an address space for `pid`, returning its directory.
///
/// # Errors
/// As [`ProcessMemory::create`]; [`MemError::DoubleAlloc`] or
/// [`MemError::OutOfMemory`] if the process table refuses it.
pub fn create_process(pid: u32) -> Result<PhysicalPage<Size4K>> {
    with_memory(|m| {
        let process = ProcessMemory::create(&mut m.kernel, pid)?;
        let directory = process.directory();
        match m.processes.insert(process) {
            Ok(()) => Ok(directory),
            Err((e, process)) => {
                process.destroy(&mut m.kernel)?;
                Err(e)
            }
        }
    })
}

/// # Errors
/// [`MemError::InvalidArgument`] for an unknown `pid`, else as
/// [`ProcessMemory::load`].
pub fn load_process(pid: u32, image: &[u8]) -> Result<VirtualAddress> {
    with_memory(|m| {
        let process = m.processes.get_mut(pid).ok_or(MemError::InvalidArgument)?;
        process.load(&mut m.kernel, image)
    })
}

/// # Errors
/// [`MemError::InvalidArgument`] for an unknown `pid`, else as
/// [`ProcessMemory::alloc_stack`].
pub fn alloc_process_stack(pid: u32, pages: u32) -> Result<VirtualAddress> {
    with_memory(|m| {
        let process = m.processes.get_mut(pid).ok_or(MemError::InvalidArgument)?;
        process.alloc_stack(&mut m.kernel, pages)
    })
}

/// # Errors
/// [`MemError::InvalidArgument`] for an unknown `pid`, else as
/// [`ProcessMemory::destroy`].
pub fn destroy_process(pid: u32) -> Result<()> {
    with_memory(|m| {
        let process = m.processes.remove(pid).ok_or(MemError::InvalidArgument)?;
        process.destroy(&mut m.kernel)
    })
}

/// Load CR3 with the directory of `pid`.
///
/// # Errors
/// [`MemError::InvalidArgument`] for an unknown `pid`.
///
/// # Safety
/// Call with interrupts off, from code in the kernel half.
pub unsafe fn activate_process(pid: u32) -> Result<()> {
    with_memory(|m| {
        let process = m.processes.get(pid).ok_or(MemError::InvalidArgument)?;
        let space = AddressSpace::from_directory(&WINDOW.0, process.directory());
        unsafe { space.activate() };
        log::trace!("Switched to the address space of process {pid}");
        Ok(())
    })
}

/// Resolve a not-present fault at `addr` against the directory in CR3.
///
/// # Errors
/// As [`handle_page_fault`].
pub fn page_fault(addr: VirtualAddress) -> Result<PhysicalAddress> {
    let directory = unsafe { AddressSpace::from_current(&WINDOW.0) }.directory();
    with_memory(|m| handle_page_fault(&mut m.kernel, &mut m.processes, addr, directory))
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    let _ = kernel_qemu::write_panic(&mut kernel_qemu::qemu_fmt::QemuSink, info);
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
