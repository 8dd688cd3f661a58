use vmi_core::MemoryAccess;

use crate::WindowsError;

/// Page protection of a virtual address descriptor.
///
/// The 5-bit `Protection` field of `_MMVAD_FLAGS` indexes this table. The
/// low 3 bits select the access, the high 2 bits add a caching or guard
/// modifier.
#[expect(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtectionValue {
    NoAccess,
    ReadOnly,
    Execute,
    ExecuteRead,
    ReadWrite,
    WriteCopy,
    ExecuteReadWrite,
    ExecuteWriteCopy,

    NoAccess2,
    NoCacheReadOnly,
    NoCacheExecute,
    NoCacheExecuteRead,
    NoCacheReadWrite,
    NoCacheWriteCopy,
    NoCacheExecuteReadWrite,
    NoCacheExecuteWriteCopy,

    NoAccess3,
    GuardReadOnly,
    GuardExecute,
    GuardExecuteRead,
    GuardReadWrite,
    GuardWriteCopy,
    GuardExecuteReadWrite,
    GuardExecuteWriteCopy,

    NoAccess4,
    WriteCombineReadOnly,
    WriteCombineExecute,
    WriteCombineExecuteRead,
    WriteCombineReadWrite,
    WriteCombineWriteCopy,
    WriteCombineExecuteReadWrite,
    WriteCombineExecuteWriteCopy,
}

impl ProtectionValue {
    const ALL: [Self; 32] = [
        Self::NoAccess,
        Self::ReadOnly,
        Self::Execute,
        Self::ExecuteRead,
        Self::ReadWrite,
        Self::WriteCopy,
        Self::ExecuteReadWrite,
        Self::ExecuteWriteCopy,
        Self::NoAccess2,
        Self::NoCacheReadOnly,
        Self::NoCacheExecute,
        Self::NoCacheExecuteRead,
        Self::NoCacheReadWrite,
        Self::NoCacheWriteCopy,
        Self::NoCacheExecuteReadWrite,
        Self::NoCacheExecuteWriteCopy,
        Self::NoAccess3,
        Self::GuardReadOnly,
        Self::GuardExecute,
        Self::GuardExecuteRead,
        Self::GuardReadWrite,
        Self::GuardWriteCopy,
        Self::GuardExecuteReadWrite,
        Self::GuardExecuteWriteCopy,
        Self::NoAccess4,
        Self::WriteCombineReadOnly,
        Self::WriteCombineExecute,
        Self::WriteCombineExecuteRead,
        Self::WriteCombineReadWrite,
        Self::WriteCombineWriteCopy,
        Self::WriteCombineExecuteReadWrite,
        Self::WriteCombineExecuteWriteCopy,
    ];

    fn access_bits(self) -> u8 {
        self as u8 & 0b111
    }

    fn modifier_bits(self) -> u8 {
        self as u8 >> 3
    }

    /// Checks whether the pages are copied on the first write.
    pub fn is_copy_on_write(self) -> bool {
        matches!(self.access_bits(), 5 | 7)
    }

    /// Checks whether the pages are mapped uncached.
    pub fn is_no_cache(self) -> bool {
        self.modifier_bits() == 1 && self.access_bits() != 0
    }

    /// Checks whether the pages are guard pages.
    pub fn is_guard(self) -> bool {
        self.modifier_bits() == 2 && self.access_bits() != 0
    }

    /// Checks whether the pages are mapped write-combined.
    pub fn is_write_combine(self) -> bool {
        self.modifier_bits() == 3 && self.access_bits() != 0
    }
}

impl TryFrom<u32> for ProtectionValue {
    type Error = WindowsError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WindowsError::InvalidProtection(value))
    }
}

impl From<ProtectionValue> for MemoryAccess {
    fn from(value: ProtectionValue) -> Self {
        // Copy-on-write pages are writable from the process' point of view.
        match value.access_bits() {
            1 => MemoryAccess::R,
            2 => MemoryAccess::X,
            3 => MemoryAccess::RX,
            4 | 5 => MemoryAccess::RW,
            6 | 7 => MemoryAccess::RWX,
            _ => MemoryAccess::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_keep_access() -> Result<(), WindowsError> {
        assert_eq!(MemoryAccess::from(ProtectionValue::try_from(4)?), MemoryAccess::RW);
        assert_eq!(MemoryAccess::from(ProtectionValue::try_from(12)?), MemoryAccess::RW);
        assert_eq!(MemoryAccess::from(ProtectionValue::try_from(20)?), MemoryAccess::RW);
        assert_eq!(MemoryAccess::from(ProtectionValue::try_from(28)?), MemoryAccess::RW);

        assert_eq!(
            MemoryAccess::from(ProtectionValue::GuardExecuteRead),
            MemoryAccess::RX
        );
        assert!(ProtectionValue::GuardExecuteRead.is_guard());
        assert!(ProtectionValue::NoCacheReadOnly.is_no_cache());
        assert!(ProtectionValue::WriteCombineExecuteWriteCopy.is_write_combine());
        Ok(())
    }

    #[test]
    fn no_access_variants() -> Result<(), WindowsError> {
        for value in [0, 8, 16, 24] {
            let protection = ProtectionValue::try_from(value)?;
            assert_eq!(MemoryAccess::from(protection), MemoryAccess::default());
            assert!(!protection.is_guard());
            assert!(!protection.is_no_cache());
        }

        Ok(())
    }

    #[test]
    fn write_copy_is_writable() {
        assert!(ProtectionValue::WriteCopy.is_copy_on_write());
        assert!(ProtectionValue::GuardExecuteWriteCopy.is_copy_on_write());
        assert_eq!(
            MemoryAccess::from(ProtectionValue::ExecuteWriteCopy),
            MemoryAccess::RWX
        );
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(matches!(
            ProtectionValue::try_from(32),
            Err(WindowsError::InvalidProtection(32))
        ));
    }
}
