use crate::{Pa, Va, os::OsType};

/// An error that can occur when working with the VMI.
#[derive(thiserror::Error, Debug)]
pub enum VmiError {
    /// An error occurred in the VMI driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error>),

    /// A plugin failed while processing a notification.
    #[error(transparent)]
    Plugin(Box<dyn std::error::Error>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A page fault occurred.
    #[error("Page not present ({:?}, len: {})", .0[0], .0.len())]
    PageFault(PageFaults),

    /// Another interrupt event is already registered at the address.
    #[error("Interrupt already registered at {0}")]
    BreakpointAlreadyRegistered(Pa),

    /// The original instruction at the address already is a breakpoint.
    #[error("Breakpoint instruction already present at {0}")]
    BreakpointAlreadyPresent(Pa),

    /// A callback of an interrupt event failed.
    #[error("Interrupt `{name}` at {address} failed")]
    Interrupt {
        /// Name of the interrupt event.
        name: String,

        /// Target physical address of the interrupt event.
        address: Pa,

        /// The error returned by the callback.
        #[source]
        source: Box<VmiError>,
    },

    /// The guest operating system is not supported.
    #[error("Unsupported operating system: {0:?}")]
    UnsupportedOs(OsType),

    /// The combination of guest operating system and architecture is not
    /// supported.
    #[error("No support for {os:?} on {architecture} yet")]
    UnsupportedPlatform {
        /// The guest operating system.
        os: OsType,

        /// Name of the architecture.
        architecture: &'static str,
    },

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Root not present.
    #[error("Root not present")]
    RootNotPresent,

    /// Timeout.
    #[error("Operation timed out.")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The virtual address that caused the page fault.
    pub address: Va,

    /// The root of the page table hierarchy.
    pub root: Pa,
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl VmiError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::PageFault(smallvec::smallvec![pf.into()])
    }

    /// Wraps an error returned by an interrupt callback.
    pub fn interrupt(name: impl Into<String>, address: Pa, source: VmiError) -> Self {
        Self::Interrupt {
            name: name.into(),
            address,
            source: Box::new(source),
        }
    }

    /// Wraps an error returned by a plugin.
    pub fn plugin(err: impl std::error::Error + 'static) -> Self {
        Self::Plugin(Box::new(err))
    }

    /// Returns `true` if the error does not indicate a failure of the
    /// event loop.
    ///
    /// A timed-out wait and a wait interrupted by a signal both return
    /// control to the loop without any event having been lost.
    pub fn is_benign_wait_error(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_error_keeps_address() {
        let err = VmiError::interrupt("fork", Pa(0x1000), VmiError::Other("boom"));
        assert_eq!(err.to_string(), "Interrupt `fork` at 0x0000000000001000 failed");

        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("boom"));
    }

    #[test]
    fn benign_wait_errors() {
        assert!(VmiError::Timeout.is_benign_wait_error());
        assert!(
            VmiError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted))
                .is_benign_wait_error()
        );
        assert!(!VmiError::Other("driver gone").is_benign_wait_error());
    }
}
