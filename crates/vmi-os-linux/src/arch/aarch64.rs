use vmi_arch_aarch64::{Aarch64, Registers};
use vmi_core::{AddressContext, Registers as _, Va, VmiCore, VmiDriver, VmiError};

use super::ArchAdapter;

impl<Driver> ArchAdapter<Driver> for Aarch64
where
    Driver: VmiDriver<Architecture = Self>,
{
    // AAPCS64: x0 to x7, then the stack.
    fn function_argument(
        vmi: &VmiCore<Driver>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmiError> {
        if index < 8 {
            return Ok(registers.x[index as usize]);
        }

        let stack = Va(registers.sp + (index - 8) * size_of::<u64>() as u64);
        vmi.read_u64(AddressContext::new(stack, registers.translation_root(stack)))
    }
}
