//! # x86 Page Directory (PD / L2)
//!
//! - [`L2Index`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: either a pointer to a PT (`PS=0`) or a 4 MiB leaf (`PS=1`).
//! - [`PdEntryKind`]: decoded view of an entry.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PD entries.
//!
//! The kernel only creates `PS=0` entries. 4 MiB leaves are understood so
//! that a directory set up by the boot stub can be walked.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_info::memory::KERNEL_PDE_START;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this entry belongs to the shared kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.as_usize() >= KERNEL_PDE_START
    }
}

/// Decoded PDE.
#[derive(Copy, Clone, Debug)]
pub enum PdEntryKind {
    /// Points at a page table.
    NextPageTable(PhysicalPage<Size4K>, PageEntryBits),
    /// Maps a 4 MiB page directly.
    Leaf4MiB(PhysicalPage<Size4M>, PageEntryBits),
}

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct PdEntry(PageEntryBits);

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// Decode a present entry.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }
        let pa = self.0.physical_address();
        if self.0.large_page() {
            Some(PdEntryKind::Leaf4MiB(PhysicalPage::containing_address(pa), self.0))
        } else {
            Some(PdEntryKind::NextPageTable(PhysicalPage::containing_address(pa), self.0))
        }
    }

    /// The page table this entry points at, if any.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::NextPageTable(pt, _)) => Some(pt),
            _ => None,
        }
    }

    /// Create a non-leaf PDE pointing to a page table (`PS=0`).
    #[inline]
    #[must_use]
    pub const fn make_next(pt_page: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(pt_page.base());
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

/// The Page Directory (L2): 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// The entries of the kernel half.
    #[inline]
    #[must_use]
    pub fn kernel_entries(&self) -> &[PdEntry] {
        &self.entries[KERNEL_PDE_START..]
    }

    #[inline]
    pub fn kernel_entries_mut(&mut self) -> &mut [PdEntry] {
        &mut self.entries[KERNEL_PDE_START..]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pde_next_table() {
        let pt = PhysicalPage::<Size4K>::containing_address(PhysicalAddress::new(0x0003_4000));
        let e = PdEntry::make_next(pt, PageEntryBits::new_user_rw());
        assert_eq!(e.next_table(), Some(pt));
        assert!(matches!(e.kind(), Some(PdEntryKind::NextPageTable(p, _)) if p == pt));
        assert_eq!(e.raw(), 0x0003_4007);
    }

    #[test]
    fn pde_large_page_has_no_table() {
        let mut bits = PageEntryBits::new_kernel_rw().with_large_page(true);
        bits.set_physical_address(PhysicalAddress::new(0x0040_0000));
        let e = PdEntry(bits);
        assert!(e.next_table().is_none());
        let Some(PdEntryKind::Leaf4MiB(page, _)) = e.kind() else {
            panic!("expected a 4 MiB leaf");
        };
        assert_eq!(page.base(), PhysicalAddress::new(0x0040_0000));
    }

    #[test]
    fn kernel_half_starts_at_768() {
        assert!(!L2Index::new(767).is_kernel());
        assert!(L2Index::new(768).is_kernel());
        let pd = PageDirectory::zeroed();
        assert_eq!(pd.kernel_entries().len(), 256);
    }
}
