use vmi_arch_amd64::{Amd64, Registers};
use vmi_core::{AddressContext, Registers as _, Va, VmiCore, VmiDriver, VmiError};

use super::ArchAdapter;

impl<Driver> ArchAdapter<Driver> for Amd64
where
    Driver: VmiDriver<Architecture = Self>,
{
    // Microsoft x64: rcx, rdx, r8, r9, then the stack past the return
    // address and the 32 bytes of home space.
    fn function_argument(
        vmi: &VmiCore<Driver>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmiError> {
        match index {
            0 => Ok(registers.rcx),
            1 => Ok(registers.rdx),
            2 => Ok(registers.r8),
            3 => Ok(registers.r9),
            _ => {
                let stack = Va(registers.rsp + (index + 1) * size_of::<u64>() as u64);
                vmi.read_u64(AddressContext::new(stack, registers.translation_root(stack)))
            }
        }
    }
}
