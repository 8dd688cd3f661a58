use crate::{VmiError, os::ActiveProcess};

/// Receives notifications destined to plugins.
///
/// The plugin system itself lives outside of the monitor; this trait is the
/// contract the monitor relies on.
pub trait PluginNotifier {
    /// Initializes the plugin `name` with the given arguments.
    fn initialize_plugin(&mut self, name: &str, arguments: &[String]) -> Result<(), VmiError>;

    /// Called when a process terminates.
    ///
    /// The record is still registered when this is called, and is removed
    /// from the registry right after it returns.
    fn on_process_termination(&mut self, process: &ActiveProcess) -> Result<(), VmiError>;

    /// Called once when the monitor shuts down, with the guest paused.
    fn on_shutdown(&mut self) -> Result<(), VmiError>;
}
