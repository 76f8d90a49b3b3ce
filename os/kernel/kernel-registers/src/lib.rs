//! # Typed `x86` Registers
//!
//! Only what the memory subsystem touches: CR3 (page directory base) and the
//! TLB maintenance instructions. The instructions are emitted when the `asm`
//! feature is enabled and the target is 32-bit x86; on any other target the
//! register types still exist so page table code can be tested on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod tlb;

pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
