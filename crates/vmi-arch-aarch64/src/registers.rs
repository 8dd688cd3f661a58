use vmi_core::{Pa, Va};

/// The subset of the AArch64 register file the monitor works with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    /// General purpose registers `X0` to `X30`.
    pub x: [u64; 31],

    /// Stack pointer.
    pub sp: u64,

    /// Program counter.
    pub pc: u64,

    /// Process state.
    pub pstate: u64,

    /// Translation table base for the lower virtual address range.
    pub ttbr0_el1: u64,

    /// Translation table base for the upper (kernel) virtual address range.
    pub ttbr1_el1: u64,
}

impl Registers {
    const BADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

    /// Checks whether `va` belongs to the upper virtual address range.
    pub fn is_upper_half(va: Va) -> bool {
        va.0 & (1 << 55) != 0
    }
}

impl vmi_core::Registers for Registers {
    fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    fn translation_root(&self, va: Va) -> Pa {
        let ttbr = if Self::is_upper_half(va) {
            self.ttbr1_el1
        } else {
            self.ttbr0_el1
        };

        Pa(ttbr & Self::BADDR_MASK)
    }
}
