use vmi_core::Gfn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The levels of the 4-level (IA-32e) paging structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table.
    Pt,

    /// Page Directory.
    Pd,

    /// Page Directory Pointer Table.
    Pdpt,

    /// Page Map Level 4.
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level, or `None` for the last one.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Bit position of the lowest virtual address bit indexing this level.
    pub fn shift(self) -> u64 {
        match self {
            Self::Pt => 12,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
        }
    }
}

/// A page table entry.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the entry maps a large page (PS bit).
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Returns the page frame number the entry points to.
    pub fn pfn(self) -> Gfn {
        const MASK: u64 = (1 << 40) - 1;
        Gfn((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("large", &self.large())
            .field("pfn", &self.pfn())
            .finish()
    }
}
