use std::cell::Ref;

use super::ActiveProcesses;
use crate::{VmiCore, VmiDriver, VmiError};

/// Supervises process lifecycle events of one guest operating system
/// family.
///
/// Implementations hook the kernel notification points of their OS
/// (process fork, exec and exit) and keep the registry of active
/// processes consistent with them.
pub trait SystemEventSupervisor<Driver>
where
    Driver: VmiDriver,
{
    /// Initializes the registry and arms the kernel notification hooks.
    ///
    /// Must be called while the guest is paused.
    fn initialize(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError>;

    /// Disarms and destroys every hook owned by the supervisor.
    fn teardown(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError>;

    /// Returns the registry of active processes.
    fn active_processes(&self) -> Ref<'_, ActiveProcesses<Driver>>;
}
