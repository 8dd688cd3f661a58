use indexmap::{IndexMap, map::Entry};

use super::{ActiveProcess, ProcessId, ProcessInspector, ProcessObject};
use crate::{VmiCore, VmiDriver, VmiError};

/// Registry of live guest processes.
///
/// Records are keyed by their [`ProcessObject`] and kept in insertion
/// order. The registry is mutated only by a system event supervisor, in
/// response to fork, exec and exit notifications.
pub struct ActiveProcesses<Driver>
where
    Driver: VmiDriver,
{
    inspector: Box<dyn ProcessInspector<Driver>>,
    processes: IndexMap<ProcessObject, ActiveProcess>,
}

impl<Driver> ActiveProcesses<Driver>
where
    Driver: VmiDriver,
{
    /// Creates an empty registry backed by the given inspector.
    pub fn new(inspector: impl ProcessInspector<Driver> + 'static) -> Self {
        Self {
            inspector: Box::new(inspector),
            processes: IndexMap::new(),
        }
    }

    /// Populates the registry with the processes already running in the
    /// guest.
    ///
    /// Processes whose kernel structures are paged out are skipped.
    pub fn initialize(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        self.processes.clear();

        for object in self.inspector.processes(vmi)? {
            match self.inspector.inspect(vmi, object) {
                Ok(process) => {
                    self.processes.insert(object, process);
                }
                Err(VmiError::PageFault(pfs)) => {
                    tracing::warn!(%object, ?pfs, "skipping inaccessible process");
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(count = self.processes.len(), "active processes initialized");
        Ok(())
    }

    /// Adds the process with the given kernel control structure.
    ///
    /// A process that is already tracked (e.g. on `exec`) has its record
    /// refreshed in place.
    pub fn add_process(
        &mut self,
        vmi: &VmiCore<Driver>,
        object: ProcessObject,
    ) -> Result<&ActiveProcess, VmiError> {
        let process = self.inspector.inspect(vmi, object)?;

        match self.processes.entry(object) {
            Entry::Occupied(mut entry) => {
                tracing::debug!(%object, pid = %process.id, name = %process.name, "process updated");
                entry.insert(process);
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                tracing::debug!(%object, pid = %process.id, name = %process.name, "process added");
                Ok(entry.insert(process))
            }
        }
    }

    /// Removes the process with the given kernel control structure.
    ///
    /// Removing an unknown process is not an error, it is only logged.
    pub fn remove_process(&mut self, object: ProcessObject) -> Option<ActiveProcess> {
        let process = self.processes.shift_remove(&object);

        match &process {
            Some(process) => {
                tracing::debug!(%object, pid = %process.id, name = %process.name, "process removed")
            }
            None => tracing::warn!(%object, "exit of an unknown process"),
        }

        process
    }

    /// Returns the process with the given kernel control structure.
    pub fn process(&self, object: ProcessObject) -> Option<&ActiveProcess> {
        self.processes.get(&object)
    }

    /// Returns the process with the given process ID.
    pub fn process_by_id(&self, id: ProcessId) -> Option<&ActiveProcess> {
        self.processes.values().find(|process| process.id == id)
    }

    /// Checks whether the process is tracked.
    pub fn contains(&self, object: ProcessObject) -> bool {
        self.processes.contains_key(&object)
    }

    /// Returns an iterator over the tracked processes, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveProcess> {
        self.processes.values()
    }

    /// Returns the number of tracked processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Checks whether no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
