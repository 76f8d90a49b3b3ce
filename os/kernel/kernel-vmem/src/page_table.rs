//! # Memory Page Table
//!
//! The two paging levels of 32-bit x86 without PAE: a page directory of 1024
//! entries, each pointing at a page table of 1024 entries.

pub mod pd;
pub mod pt;

use crate::page_table::pd::L2Index;
use crate::page_table::pt::L1Index;
use kernel_memory_addresses::VirtualAddress;

/// Entries per directory and per table.
pub const ENTRIES: usize = kernel_info::memory::ENTRIES_PER_TABLE;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L2Index, L1Index) {
    (L2Index::from(va), L1Index::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xFFBF_F123);
        let (i2, i1) = split_indices(va);
        assert_eq!(i2.as_usize(), 1022);
        assert_eq!(i1.as_usize(), 1023);
    }
}
