use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Memory access permission flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Read and write.
        const RW = Self::R.bits() | Self::W.bits();

        /// Read and execute.
        const RX = Self::R.bits() | Self::X.bits();

        /// Read, write and execute.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let flag = |access, c| if self.contains(access) { c } else { '-' };

        write!(
            f,
            "{}{}{}",
            flag(MemoryAccess::R, 'r'),
            flag(MemoryAccess::W, 'w'),
            flag(MemoryAccess::X, 'x')
        )
    }
}
