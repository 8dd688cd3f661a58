//! Breakpoint-driven process lifecycle monitoring for Virtual Machine
//! Introspection.
//!
//! The monitor hooks the kernel routines that announce process creation
//! and termination with software breakpoints, keeps a registry of the
//! processes running in the guest, and forwards terminations to plugins.
//!
//! The building blocks live in the member crates and are re-exported here:
//!
//! - [`core`]: addresses, the driver abstraction, the process registry.
//! - [`utils`]: interrupt events and single-step handling.
//! - [`arch`]: architecture profiles.
//! - [`os`]: per-OS system event supervisors.
//!
//! # Example
//!
//! ```no_run
//! # use std::{cell::RefCell, rc::Rc};
//! # use vmi_monitor::{
//! #     Monitor, MonitorConfig, PluginArguments,
//! #     core::{PluginNotifier, VmiCore, VmiDriver, VmiError, os::ProcessInspector},
//! #     platform::Platform,
//! # };
//! fn monitor<Driver>(
//!     driver: Driver,
//!     plugins: Rc<RefCell<dyn PluginNotifier>>,
//!     inspector: impl ProcessInspector<Driver> + Clone + 'static,
//! ) -> Result<i32, Box<dyn std::error::Error>>
//! where
//!     Driver: VmiDriver + 'static,
//!     Driver::Architecture: Platform,
//! {
//!     let config = MonitorConfig::from_file("monitor.json")?;
//!     let vmi = VmiCore::new(driver)?;
//!
//!     let monitor = Monitor::new(vmi, config, plugins, move |_os| {
//!         Ok(Box::new(inspector.clone()))
//!     });
//!
//!     Ok(monitor.run(&PluginArguments::new())?)
//! }
//! ```

mod config;
mod context;
mod event_stream;
mod monitor;
pub mod platform;

pub use vmi_core as core;
pub use vmi_utils as utils;

pub use self::{
    config::{ConfigError, MonitorConfig, PluginArguments, PluginConfig},
    context::{EXIT_FAILURE, SessionContext, SignalSender},
    event_stream::{EventStream, TracingEventStream},
    monitor::{InspectorFactory, Monitor},
};

/// Architecture profiles.
pub mod arch {
    #[cfg(feature = "arch-aarch64")]
    pub use vmi_arch_aarch64 as aarch64;
    #[cfg(feature = "arch-amd64")]
    pub use vmi_arch_amd64 as amd64;
}

/// Per-OS system event supervisors.
pub mod os {
    #[cfg(feature = "os-linux")]
    pub use vmi_os_linux as linux;
    #[cfg(feature = "os-windows")]
    pub use vmi_os_windows as windows;
}
