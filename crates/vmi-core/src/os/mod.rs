//! Operating-system level types.
//!
//! The monitor does not parse guest kernel structures itself. It only
//! tracks which kernel control structures (`task_struct`, `EPROCESS`)
//! belong to live processes, and relies on a [`ProcessInspector`] to turn
//! such a structure into an [`ActiveProcess`] record.

mod process;
mod region;
mod registry;
mod supervisor;

use serde::{Deserialize, Serialize};

pub use self::{
    process::{ActiveProcess, ProcessId, ProcessInspector, ProcessObject},
    region::MemoryRegion,
    registry::ActiveProcesses,
    supervisor::SystemEventSupervisor,
};

/// Operating system family running in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsType {
    /// Linux.
    Linux,

    /// Microsoft Windows.
    Windows,

    /// The driver could not determine the operating system.
    Unknown,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Linux => f.write_str("Linux"),
            Self::Windows => f.write_str("Windows"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}
