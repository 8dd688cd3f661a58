use serde::{Deserialize, Serialize};

use super::MemoryRegion;
use crate::{Pa, Va, VmiCore, VmiDriver, VmiError};

/// A process object within a system.
///
/// Equivalent to `EPROCESS*` on Windows or `task_struct*` on Linux. This is
/// the key the registry uses to identify a process.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcessObject(pub Va);

impl ProcessObject {
    /// Checks if the process object is a null reference.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl From<Va> for ProcessObject {
    fn from(va: Va) -> Self {
        Self(va)
    }
}

impl From<ProcessObject> for Va {
    fn from(value: ProcessObject) -> Self {
        value.0
    }
}

impl std::fmt::Display for ProcessObject {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process ID within a system.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live guest process, as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProcess {
    /// Base address of the kernel control structure of the process.
    pub object: ProcessObject,

    /// Guest-assigned process identifier.
    pub id: ProcessId,

    /// Identifier of the parent process.
    pub parent_id: ProcessId,

    /// Name of the process.
    pub name: String,

    /// Root of the address space of the process.
    pub translation_root: Pa,

    /// Memory regions of the process.
    pub regions: Vec<MemoryRegion>,
}

impl ActiveProcess {
    /// Returns the memory region containing `address`, if any.
    pub fn find_region(&self, address: Va) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.contains(address))
    }
}

/// Extracts process information from guest kernel structures.
///
/// Implemented outside of the monitor, by whatever component knows the
/// layout of the guest kernel.
pub trait ProcessInspector<Driver>
where
    Driver: VmiDriver,
{
    /// Returns the process objects of all processes running in the guest.
    fn processes(&self, vmi: &VmiCore<Driver>) -> Result<Vec<ProcessObject>, VmiError>;

    /// Reads the process record of the given process object.
    fn inspect(
        &self,
        vmi: &VmiCore<Driver>,
        object: ProcessObject,
    ) -> Result<ActiveProcess, VmiError>;
}

impl<Driver, T> ProcessInspector<Driver> for Box<T>
where
    Driver: VmiDriver,
    T: ProcessInspector<Driver> + ?Sized,
{
    fn processes(&self, vmi: &VmiCore<Driver>) -> Result<Vec<ProcessObject>, VmiError> {
        (**self).processes(vmi)
    }

    fn inspect(
        &self,
        vmi: &VmiCore<Driver>,
        object: ProcessObject,
    ) -> Result<ActiveProcess, VmiError> {
        (**self).inspect(vmi, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_object() {
        assert!(ProcessObject::default().is_null());
        assert!(!ProcessObject(Va(0xffff_8880_0100_0000)).is_null());
    }
}
