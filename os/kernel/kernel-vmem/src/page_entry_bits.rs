use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// Page directory entries and page table entries share this layout; the
/// meaning of bit 7 differs (PS in a PDE, PAT in a PTE).
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|----------|
/// | 0      | `P`             | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (PTE only) |
/// | 7      | `PS` / `PAT`    | 4 MiB page (PDE) or PAT index bit (PTE) |
/// | 8      | `G`             | Global (PTE only) |
/// | 9–11   | OS avail        | Reserved for OS use |
/// | 12–31  | `addr`          | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new_kernel_rw();
/// e.set_physical_address(PhysicalAddress::new(0x12345));
/// assert!(e.present());
/// assert_eq!(e.physical_address(), PhysicalAddress::new(0x12000));
/// ```
#[bitfield(u32)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear implies a not-present entry; access faults.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access; clear restricts to supervisor only.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE: the entry maps a 4 MiB page instead
    /// of pointing at a page table. PAT in a PTE; kept clear.
    pub large_page: bool,

    /// Global (G, bit 8). The TLB entry survives a CR3 reload.
    pub global_translation: bool,

    /// OS-available (bits 9..=11); hardware ignores these.
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame_number(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << 12)
    }

    /// Present, writable, supervisor only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, supervisor only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Present, writable, user accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Present, read-only, user accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }
}
