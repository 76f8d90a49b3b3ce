//! # Kernel Boot Information

/// Boot loader hand-off record.
///
/// All pointers are physical addresses inside the low 4 MiB that the boot
/// stub identity-maps and mirrors at the kernel base.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RawBootInfo {
    /// Physical address of a [`MemoryMapEntry`] array.
    pub memory_map_ptr: u32,
    /// Number of [`MemoryMapEntry`] records.
    pub memory_map_count: u32,
    /// Physical address of a [`LoadedFile`] array.
    pub files_ptr: u32,
    /// Number of [`LoadedFile`] records.
    pub files_count: u32,
    /// Where the kernel image was loaded.
    pub kernel_image: LoadedFile,
}

/// Type of a memory map entry, as reported by the BIOS (`E820`).
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Available = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Bad = 5,
}

impl MemoryKind {
    /// Unknown types are treated as reserved.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        match value {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            _ => Self::Reserved,
        }
    }
}

/// One memory map record.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MemoryMapEntry {
    base: u64,
    length: u64,
    kind: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base,
            length,
            kind: kind as u32,
        }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn kind(&self) -> MemoryKind {
        MemoryKind::from_raw(self.kind)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind(), MemoryKind::Available)
    }
}

impl core::fmt::Debug for MemoryMapEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryMapEntry")
            .field("base", &format_args!("{:#X}", self.base()))
            .field("length", &format_args!("{:#X}", self.length()))
            .field("kind", &self.kind())
            .finish()
    }
}

/// A file the boot loader placed in physical memory.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct LoadedFile {
    start: u32,
    length: u32,
}

impl LoadedFile {
    #[must_use]
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    #[must_use]
    pub const fn length(&self) -> u32 {
        self.length
    }
}

impl core::fmt::Debug for LoadedFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LoadedFile({:#X}+{:#X})", self.start(), self.length())
    }
}

/// Borrowed view of the hand-off record.
#[derive(Debug, Copy, Clone)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    pub files: &'a [LoadedFile],
    pub kernel_image: LoadedFile,
}

impl BootInfo<'_> {
    /// Amount of installed RAM, i.e. the highest end address of any
    /// available memory map entry.
    #[must_use]
    pub fn installed_ram(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|e| e.is_available())
            .map(MemoryMapEntry::end)
            .max()
            .unwrap_or(0)
    }

    /// Whether `[start, start + len)` lies fully inside one available entry.
    #[must_use]
    pub fn is_available(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len);
        self.memory_map
            .iter()
            .any(|e| e.is_available() && e.base() <= start && end <= e.end())
    }

    /// The kernel image followed by every loaded file.
    pub fn occupied(&self) -> impl Iterator<Item = LoadedFile> + '_ {
        core::iter::once(self.kernel_image).chain(self.files.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: [MemoryMapEntry; 4] = [
        MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Available),
        MemoryMapEntry::new(0x9_F000, 0x6_1000, MemoryKind::Reserved),
        MemoryMapEntry::new(0x10_0000, 0x1F0_0000, MemoryKind::Available),
        MemoryMapEntry::new(0xFFFC_0000, 0x4_0000, MemoryKind::Reserved),
    ];

    #[test]
    fn installed_ram_ignores_reserved_entries() {
        let info = BootInfo {
            memory_map: &MAP,
            files: &[],
            kernel_image: LoadedFile::new(0x10_0000, 0x2_0000),
        };
        assert_eq!(info.installed_ram(), 0x200_0000);
    }

    #[test]
    fn availability_requires_a_single_entry() {
        let info = BootInfo {
            memory_map: &MAP,
            files: &[],
            kernel_image: LoadedFile::new(0x10_0000, 0x2_0000),
        };
        assert!(info.is_available(0x1000, 0x1000));
        assert!(!info.is_available(0x9_E000, 0x2000));
        assert!(!info.is_available(0xA_0000, 0x1000));
        assert!(info.is_available(0x10_0000, 0x1000));
    }

    #[test]
    fn unknown_kinds_are_reserved() {
        assert_eq!(MemoryKind::from_raw(0), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_raw(12), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_raw(1), MemoryKind::Available);
    }

    #[test]
    fn occupied_lists_kernel_first() {
        let files = [LoadedFile::new(0x40_0000, 0x1000)];
        let info = BootInfo {
            memory_map: &MAP,
            files: &files,
            kernel_image: LoadedFile::new(0x10_0000, 0x2_0000),
        };
        let starts: Vec<u32> = info.occupied().map(|f| f.start()).collect();
        assert_eq!(starts, [0x10_0000, 0x40_0000]);
    }
}
