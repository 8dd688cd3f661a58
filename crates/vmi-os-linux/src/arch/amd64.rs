use vmi_arch_amd64::{Amd64, Registers};
use vmi_core::{AddressContext, Registers as _, Va, VmiCore, VmiDriver, VmiError};

use super::ArchAdapter;

impl<Driver> ArchAdapter<Driver> for Amd64
where
    Driver: VmiDriver<Architecture = Self>,
{
    // System V: rdi, rsi, rdx, rcx, r8, r9, then the stack above the
    // return address.
    fn function_argument(
        vmi: &VmiCore<Driver>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmiError> {
        match index {
            0 => Ok(registers.rdi),
            1 => Ok(registers.rsi),
            2 => Ok(registers.rdx),
            3 => Ok(registers.rcx),
            4 => Ok(registers.r8),
            5 => Ok(registers.r9),
            _ => {
                let index = index - 6 + 1;
                let stack = Va(registers.rsp + index * size_of::<u64>() as u64);
                vmi.read_u64(AddressContext::new(stack, registers.translation_root(stack)))
            }
        }
    }
}
