use vmi_core::Gfn;

/// Event generated by a software breakpoint (`INT3`).
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// GFN of the instruction that caused the interrupt.
    /// Effectively, this is GFN of the current instruction pointer.
    pub gfn: Gfn,

    /// Length of the trapping instruction.
    pub instruction_length: u8,
}

impl vmi_core::EventInterrupt for EventInterrupt {
    fn gfn(&self) -> Gfn {
        self.gfn
    }

    fn instruction_length(&self) -> u8 {
        self.instruction_length
    }
}

/// Event generated after a single instruction executed in single-step mode.
#[derive(Debug, Clone, Copy)]
pub struct EventSinglestep {
    /// GFN of the instruction that caused the singlestep.
    pub gfn: Gfn,
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// Software breakpoint.
    Breakpoint(EventInterrupt),

    /// Single-step completion.
    Singlestep(EventSinglestep),
}

impl vmi_core::EventReason for EventReason {
    fn as_software_breakpoint(&self) -> Option<&impl vmi_core::EventInterrupt> {
        match self {
            Self::Breakpoint(interrupt) => Some(interrupt),
            _ => None,
        }
    }

    fn is_singlestep(&self) -> bool {
        matches!(self, Self::Singlestep(_))
    }
}
