//! Selection of the system event supervisor.
//!
//! The architecture is fixed by the driver type, the operating system is
//! only known once the driver has inspected the guest.

use std::{cell::RefCell, rc::Rc};

use vmi_core::{
    Architecture, PluginNotifier, VmiDriver, VmiError,
    os::{OsType, ProcessInspector, SystemEventSupervisor},
};
use vmi_utils::interrupt::InterruptController;

/// Boxed process inspector.
pub type BoxedInspector<Driver> = Box<dyn ProcessInspector<Driver>>;

/// Boxed system event supervisor.
pub type BoxedSupervisor<Driver> = Box<dyn SystemEventSupervisor<Driver>>;

/// Guest platforms the monitor can supervise.
///
/// Implemented on the architecture marker types. Chooses the system
/// event supervisor for the operating system reported by the driver.
pub trait Platform: Architecture + Sized + 'static {
    /// Creates the system event supervisor for `os`.
    fn system_event_supervisor<Driver>(
        os: OsType,
        controller: InterruptController<Driver>,
        inspector: BoxedInspector<Driver>,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
    ) -> Result<BoxedSupervisor<Driver>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self> + 'static;
}

#[cfg(feature = "arch-amd64")]
impl Platform for vmi_arch_amd64::Amd64 {
    #[cfg_attr(
        not(all(feature = "os-linux", feature = "os-windows")),
        allow(unused_variables)
    )]
    fn system_event_supervisor<Driver>(
        os: OsType,
        controller: InterruptController<Driver>,
        inspector: BoxedInspector<Driver>,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
    ) -> Result<BoxedSupervisor<Driver>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self> + 'static,
    {
        match os {
            #[cfg(feature = "os-linux")]
            OsType::Linux => Ok(Box::new(vmi_os_linux::LinuxSystemEventSupervisor::new(
                controller, inspector, plugins,
            ))),
            #[cfg(feature = "os-windows")]
            OsType::Windows => Ok(Box::new(
                vmi_os_windows::WindowsSystemEventSupervisor::new(controller, inspector, plugins),
            )),
            _ => Err(VmiError::UnsupportedOs(os)),
        }
    }
}

#[cfg(feature = "arch-aarch64")]
impl Platform for vmi_arch_aarch64::Aarch64 {
    #[cfg_attr(not(feature = "os-linux"), allow(unused_variables))]
    fn system_event_supervisor<Driver>(
        os: OsType,
        controller: InterruptController<Driver>,
        inspector: BoxedInspector<Driver>,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
    ) -> Result<BoxedSupervisor<Driver>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self> + 'static,
    {
        match os {
            #[cfg(feature = "os-linux")]
            OsType::Linux => Ok(Box::new(vmi_os_linux::LinuxSystemEventSupervisor::new(
                controller, inspector, plugins,
            ))),
            OsType::Windows => Err(VmiError::UnsupportedPlatform {
                os,
                architecture: Self::NAME,
            }),
            _ => Err(VmiError::UnsupportedOs(os)),
        }
    }
}

#[cfg(all(
    test,
    feature = "arch-amd64",
    feature = "arch-aarch64",
    feature = "os-linux",
    feature = "os-windows"
))]
mod tests {
    use vmi_arch_aarch64::Aarch64;
    use vmi_arch_amd64::Amd64;
    use vmi_core::testing::{MockDriver, MockProcessInspector, RecordingNotifier};

    use super::*;

    fn select<Arch>(os: OsType) -> Result<BoxedSupervisor<MockDriver<Arch>>, VmiError>
    where
        Arch: Platform,
    {
        let plugins: Rc<RefCell<dyn PluginNotifier>> =
            Rc::new(RefCell::new(RecordingNotifier::new()));

        Arch::system_event_supervisor(
            os,
            InterruptController::new(),
            Box::new(MockProcessInspector::new()),
            plugins,
        )
    }

    #[test]
    fn supported_platforms() {
        assert!(select::<Amd64>(OsType::Linux).is_ok());
        assert!(select::<Amd64>(OsType::Windows).is_ok());
        assert!(select::<Aarch64>(OsType::Linux).is_ok());
    }

    #[test]
    fn windows_on_aarch64_is_rejected() {
        let message = select::<Aarch64>(OsType::Windows)
            .err()
            .map(|err| err.to_string());

        assert_eq!(message.as_deref(), Some("No support for Windows on aarch64 yet"));
    }

    #[test]
    fn unknown_os_is_rejected() {
        assert!(matches!(
            select::<Amd64>(OsType::Unknown),
            Err(VmiError::UnsupportedOs(OsType::Unknown))
        ));
        assert!(matches!(
            select::<Aarch64>(OsType::Unknown),
            Err(VmiError::UnsupportedOs(OsType::Unknown))
        ));
    }
}
