#[cfg(feature = "arch-aarch64")]
mod aarch64;
#[cfg(feature = "arch-amd64")]
mod amd64;

use vmi_core::{Architecture, VmiCore, VmiDriver, VmiError};

/// Calling convention of the kernel on a given architecture.
pub trait ArchAdapter<Driver>: Architecture
where
    Driver: VmiDriver<Architecture = Self>,
{
    /// Returns the `index`-th argument of the function whose first
    /// instruction trapped.
    fn function_argument(
        vmi: &VmiCore<Driver>,
        registers: &Self::Registers,
        index: u64,
    ) -> Result<u64, VmiError>;
}
