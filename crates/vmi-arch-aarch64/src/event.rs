use vmi_core::Gfn;

/// Event generated by a software breakpoint (`BRK`).
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// GFN of the trapping instruction, as reported by the driver.
    ///
    /// Trap decoding does not rely on it; the program counter is walked
    /// through the kernel translation tables instead.
    pub gfn: Gfn,

    /// The immediate operand of the `BRK` instruction.
    pub comment: u16,
}

impl vmi_core::EventInterrupt for EventInterrupt {
    fn gfn(&self) -> Gfn {
        self.gfn
    }

    fn instruction_length(&self) -> u8 {
        4
    }
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// Software breakpoint.
    Breakpoint(EventInterrupt),

    /// Single-step completion.
    Singlestep,
}

impl vmi_core::EventReason for EventReason {
    fn as_software_breakpoint(&self) -> Option<&impl vmi_core::EventInterrupt> {
        match self {
            Self::Breakpoint(interrupt) => Some(interrupt),
            Self::Singlestep => None,
        }
    }

    fn is_singlestep(&self) -> bool {
        matches!(self, Self::Singlestep)
    }
}
