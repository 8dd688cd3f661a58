use crate::{Architecture, VcpuId};

/// An event delivered by the driver.
#[derive(Debug, Clone, Copy)]
pub struct VmiEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// The ID of the virtual CPU where the event occurred.
    vcpu_id: VcpuId,

    /// The CPU register state at the time of the event.
    registers: Arch::Registers,

    /// The reason for the event.
    reason: Arch::EventReason,
}

impl<Arch> VmiEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Creates a new VMI event.
    pub fn new(vcpu_id: VcpuId, registers: Arch::Registers, reason: Arch::EventReason) -> Self {
        Self {
            vcpu_id,
            registers,
            reason,
        }
    }

    /// Returns the ID of the virtual CPU where the event occurred.
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    /// Returns a reference to the CPU registers at the time of the event.
    pub fn registers(&self) -> &Arch::Registers {
        &self.registers
    }

    /// Returns a reference to the reason for the event.
    pub fn reason(&self) -> &Arch::EventReason {
        &self.reason
    }
}

/// Kinds of events the driver can be asked to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventMonitor {
    /// Software breakpoints (`INT3`, `BRK`).
    Breakpoint,

    /// Single-step completion.
    Singlestep,
}

bitflags::bitflags! {
    /// Flags that can be set in a VMI event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmiEventResponseFlags: u8 {
        /// Reinject the interrupt into the guest.
        const REINJECT_INTERRUPT = 1 << 0;

        /// Toggle single-step mode on the vCPU.
        const TOGGLE_SINGLESTEP = 1 << 1;
    }
}

/// A response to a VMI event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmiEventResponse {
    /// Flags associated with the response.
    pub flags: VmiEventResponseFlags,

    /// Length of the trapping instruction the guest has to skip, if the
    /// trap is not reinjected.
    pub instruction_length: Option<u8>,
}

impl VmiEventResponse {
    /// Creates a response to reinject an interrupt.
    pub fn reinject_interrupt() -> Self {
        Self::default().and_reinject_interrupt()
    }

    /// Creates a response to toggle single-step mode.
    pub fn toggle_singlestep() -> Self {
        Self::default().and_toggle_singlestep()
    }

    /// Adds the reinject interrupt flag to the response.
    pub fn and_reinject_interrupt(self) -> Self {
        Self {
            flags: self.flags | VmiEventResponseFlags::REINJECT_INTERRUPT,
            ..self
        }
    }

    /// Adds the toggle single-step flag to the response.
    pub fn and_toggle_singlestep(self) -> Self {
        Self {
            flags: self.flags | VmiEventResponseFlags::TOGGLE_SINGLESTEP,
            ..self
        }
    }

    /// Sets the instruction length for the response.
    pub fn and_set_instruction_length(self, length: u8) -> Self {
        Self {
            instruction_length: Some(length),
            ..self
        }
    }

    /// Returns `true` if the interrupt is reinjected into the guest.
    pub fn reinjects_interrupt(&self) -> bool {
        self.flags.contains(VmiEventResponseFlags::REINJECT_INTERRUPT)
    }

    /// Returns `true` if single-step mode is toggled.
    pub fn toggles_singlestep(&self) -> bool {
        self.flags.contains(VmiEventResponseFlags::TOGGLE_SINGLESTEP)
    }
}
