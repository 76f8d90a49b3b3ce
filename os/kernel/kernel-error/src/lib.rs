//! # Memory Subsystem Errors
//!
//! Two kinds of failure exist in the memory subsystem and they are kept apart
//! on purpose:
//!
//! * [`MemError`]: a condition the caller can handle (bad argument, unaligned
//!   address, exhausted pool). Returned through `Result`.
//! * [`Fatal`]: an invariant violation (double free, reserved frame touched,
//!   temporary window re-entered, corrupted heap). Never returned; it is
//!   reported through [`fatal`] which logs and stops the kernel.
//!
//! ```rust
//! # use kernel_error::MemError;
//! let err = MemError::OutOfMemory;
//! assert_eq!(err.code(), 5);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

/// Result alias used by every fallible memory operation.
pub type Result<T, E = MemError> = core::result::Result<T, E>;

/// Recoverable memory subsystem errors.
///
/// The numeric [`code`](Self::code) is what the syscall layer reports back to
/// user space in place of a global error slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid range")]
    InvalidRange,
    #[error("outside addressable range")]
    OutsideAddressableRange,
    #[error("wrong alignment")]
    WrongAlignment,
    #[error("out of memory")]
    OutOfMemory,
    #[error("double allocation")]
    DoubleAlloc,
    #[error("double free")]
    DoubleFree,
    #[error("page in wrong state")]
    PageWrongState,
}

impl MemError {
    /// Stable numeric error code. Zero is reserved for "no error".
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::InvalidArgument => 1,
            Self::InvalidRange => 2,
            Self::OutsideAddressableRange => 3,
            Self::WrongAlignment => 4,
            Self::OutOfMemory => 5,
            Self::DoubleAlloc => 6,
            Self::DoubleFree => 7,
            Self::PageWrongState => 8,
        }
    }
}

/// Invariant violations that stop the kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    #[error("bitmap state width of {bits} bits does not divide a byte")]
    BitmapWidth { bits: usize },
    #[error("bitmap index {index} out of range (capacity {capacity})")]
    BitmapIndexOutOfRange { index: usize, capacity: usize },
    #[error("bitmap state {state} does not fit in {bits} bits")]
    BitmapStateTooWide { state: u8, bits: usize },
    #[error("bitmap run of zero items")]
    BitmapEmptyRun,
    #[error("physical memory manager used before initialization")]
    PmmNotInitialized,
    #[error("physical memory manager initialized twice")]
    PmmAlreadyInitialized,
    #[error("page frame {frame} is not allocatable")]
    FrameNotAllocatable { frame: usize },
    #[error("page frame {frame} is reserved or invalid")]
    FrameImmutable { frame: usize },
    #[error("page frame {frame} is already in use")]
    FrameDoubleAlloc { frame: usize },
    #[error("page frame {frame} freed twice")]
    FrameDoubleFree { frame: usize },
    #[error("no room to record reserved page frame {frame}")]
    ReservationTableFull { frame: usize },
    #[error("temporary map window already in use")]
    TemporaryMapBusy,
    #[error("temporary map window not in use")]
    TemporaryMapIdle,
    #[error("no page frame left for a page table")]
    PageTableAllocation,
    #[error("heap block {addr:#X} is not allocated")]
    HeapFreeUnknown { addr: usize },
    #[error("heap node at {addr:#X} too small to split")]
    HeapSplitTooSmall { addr: usize },
    #[error("heap adjacency list corrupted at {addr:#X}")]
    HeapCorrupted { addr: usize },
    #[error("virtual address space list out of order at {addr:#X}")]
    VasOrder { addr: u32 },
    #[error("virtual address space slot {index} is empty")]
    VasSlotEmpty { index: usize },
    #[error("memory share {index} released more often than acquired")]
    ShareUnderflow { index: usize },
    #[error("exclusive section entered twice")]
    Reentered,
}

/// The single abort sink for [`Fatal`] conditions.
///
/// Logs the condition with the caller's location and panics; the kernel's
/// panic handler prints the report and halts the processor.
#[cold]
#[track_caller]
pub fn fatal(kind: Fatal) -> ! {
    let location = core::panic::Location::caller();
    log::error!("fatal: {kind} at {}:{}", location.file(), location.line());
    panic!("{kind}");
}

/// Unwraps a `Result`, routing `Err` through [`fatal`].
pub trait OrFatal<T> {
    /// Returns the value or stops the kernel with `kind`.
    #[track_caller]
    fn or_fatal(self, kind: Fatal) -> T;
}

impl<T, E> OrFatal<T> for core::result::Result<T, E> {
    #[inline]
    fn or_fatal(self, kind: Fatal) -> T {
        match self {
            Ok(v) => v,
            Err(_) => fatal(kind),
        }
    }
}

impl<T> OrFatal<T> for Option<T> {
    #[inline]
    fn or_fatal(self, kind: Fatal) -> T {
        match self {
            Some(v) => v,
            None => fatal(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_nonzero() {
        let all = [
            MemError::InvalidArgument,
            MemError::InvalidRange,
            MemError::OutsideAddressableRange,
            MemError::WrongAlignment,
            MemError::OutOfMemory,
            MemError::DoubleAlloc,
            MemError::DoubleFree,
            MemError::PageWrongState,
        ];
        let mut codes: Vec<u32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    #[should_panic(expected = "page frame 3 freed twice")]
    fn fatal_panics_with_message() {
        fatal(Fatal::FrameDoubleFree { frame: 3 });
    }

    #[test]
    #[should_panic(expected = "no page frame left for a page table")]
    fn or_fatal_on_none() {
        let _: u32 = None.or_fatal(Fatal::PageTableAllocation);
    }

    #[test]
    fn or_fatal_passes_values_through() {
        let v: core::result::Result<u32, ()> = Ok(7);
        assert_eq!(v.or_fatal(Fatal::Reentered), 7);
    }
}
