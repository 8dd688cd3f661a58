use vmi_core::Gfn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Translation table levels of the 4 KiB granule, 48-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Level 3, maps 4 KiB pages.
    L3,

    /// Level 2, may map 2 MiB blocks.
    L2,

    /// Level 1, may map 1 GiB blocks.
    L1,

    /// Level 0, table descriptors only.
    L0,
}

impl PageTableLevel {
    /// Returns the next lower level, or `None` for the last one.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::L3 => None,
            Self::L2 => Some(Self::L3),
            Self::L1 => Some(Self::L2),
            Self::L0 => Some(Self::L1),
        }
    }

    /// Bit position of the lowest virtual address bit indexing this level.
    pub fn shift(self) -> u64 {
        match self {
            Self::L3 => 12,
            Self::L2 => 21,
            Self::L1 => 30,
            Self::L0 => 39,
        }
    }

    /// Checks whether a block descriptor is valid at this level.
    pub fn allows_block(self) -> bool {
        matches!(self, Self::L1 | Self::L2)
    }
}

/// A stage 1 translation table descriptor.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const OUTPUT_ADDRESS_MASK: u64 = 0x0000_ffff_ffff_f000;

    /// Checks if the descriptor is valid (bit 0).
    pub fn valid(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Checks if the descriptor is a table descriptor, or a page descriptor
    /// at level 3 (bit 1).
    ///
    /// A valid descriptor with this bit clear is a block descriptor.
    pub fn table_or_page(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// Returns the frame number of the output address.
    pub fn pfn(self) -> Gfn {
        Gfn((self.0 & Self::OUTPUT_ADDRESS_MASK) >> 12)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("valid", &self.valid())
            .field("table_or_page", &self.table_or_page())
            .field("pfn", &self.pfn())
            .finish()
    }
}
