use vmi_core::{Pa, Va};

/// The RFLAGS trap flag, raised by the hypervisor while single-stepping.
pub const RFLAGS_TF: u64 = 1 << 8;

/// The subset of the AMD64 register file the monitor works with.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr3: u64,
}

impl vmi_core::Registers for Registers {
    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn translation_root(&self, _va: Va) -> Pa {
        Pa(self.cr3 & 0x0000_ffff_ffff_f000)
    }
}
