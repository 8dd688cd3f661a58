use std::time::Duration;

use crate::{
    Architecture, EventMonitor, Gfn, MemoryAccess, Pa, Va, VmiError, VmiEvent, VmiEventResponse,
    VmiInfo, VmiMappedPage,
    os::{OsType, ProcessId},
};

/// Introspection driver adapter.
///
/// The driver bridges the monitor to the hypervisor. It must deliver events
/// from all virtual CPUs one at a time, through a single invocation of the
/// handler passed to [`wait_for_event`](Self::wait_for_event).
pub trait VmiDriver {
    /// The architecture supported by the driver.
    type Architecture: Architecture + ?Sized;

    /// Retrieves information about the virtual machine.
    fn info(&self) -> Result<VmiInfo, VmiError>;

    /// Returns the operating system family running in the guest.
    fn os_type(&self) -> Result<OsType, VmiError>;

    /// Pauses the virtual machine.
    fn pause(&self) -> Result<(), VmiError>;

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), VmiError>;

    /// Retrieves the memory access permissions for a specific GFN.
    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError>;

    /// Sets the memory access permissions for a specific GFN.
    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError>;

    /// Reads a page of memory from the virtual machine.
    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError>;

    /// Writes data to a page of memory in the virtual machine.
    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<VmiMappedPage, VmiError>;

    /// Translates a kernel symbol to its virtual address.
    fn kernel_symbol(&self, name: &str) -> Result<Va, VmiError>;

    /// Returns the root of the address space of the process with the given
    /// ID.
    fn translation_root(&self, pid: ProcessId) -> Result<Pa, VmiError>;

    /// Enables delivery of the given kind of events.
    fn monitor_enable(&self, option: EventMonitor) -> Result<(), VmiError>;

    /// Disables delivery of the given kind of events.
    fn monitor_disable(&self, option: EventMonitor) -> Result<(), VmiError>;

    /// Returns the number of pending events.
    fn events_pending(&self) -> usize;

    /// Waits for an event to occur and processes it with the provided
    /// handler.
    ///
    /// Returns [`VmiError::Timeout`] if no event arrived within `timeout`.
    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Self::Architecture>) -> VmiEventResponse,
    ) -> Result<(), VmiError>;
}
