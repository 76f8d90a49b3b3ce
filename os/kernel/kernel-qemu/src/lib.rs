//! # QEMU Debug Output
//!
//! Kernel log output through QEMU's debug console port.
//!
//! ## Architecture
//!
//! ```text
//! log::info!() / qemu_trace!()
//!     ↓
//! QemuSink (fmt::Write)
//!     ↓
//! dbg_putc() → I/O port 0x402
//!     ↓
//! qemu -debugcon stdio
//! ```
//!
//! Nothing allocates: records are formatted straight into the port.
//!
//! ## Features
//!
//! * `enabled` (default): bytes go to port `0x402` when built for 32-bit
//!   x86. Without it, or on any other target, output is discarded.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().ok();
//! log::info!("memory subsystem up");
//! ```
//!
//! Host side:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_panic, write_record};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    #[cfg(all(feature = "enabled", target_arch = "x86"))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single character to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_arch = "x86"))]
        unsafe {
            outb(QEMU_DEBUG_PORT, c);
        }
        #[cfg(not(all(feature = "enabled", target_arch = "x86")))]
        let _ = c;
    }

    #[cfg(all(feature = "enabled", target_arch = "x86"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// Byte sink for the debug port.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the port cannot fail.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// `print!`-style output straight to the debug port, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
