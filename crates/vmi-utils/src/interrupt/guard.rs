use vmi_core::{Architecture as _, Gfn, MemoryAccess, Pa, VmiCore, VmiDriver, VmiError};

/// An auxiliary resource bound to the lifetime of an interrupt event.
///
/// Set up once, right before the breakpoint is first written, and torn down
/// together with the interrupt event.
pub trait InterruptGuard<Driver>
where
    Driver: VmiDriver,
{
    /// Acquires the resource for the breakpoint at `address`.
    fn setup(&mut self, vmi: &VmiCore<Driver>, address: Pa) -> Result<(), VmiError>;

    /// Releases the resource.
    fn teardown(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError>;
}

/// Relaxes the memory protection of the page holding a breakpoint.
///
/// Pages that are monitored for write or execute accesses would fault on
/// every breakpoint write and every re-execution. The guard grants the
/// extra access for the lifetime of the breakpoint and restores the
/// original access on teardown.
pub struct ProtectionGuard {
    access: MemoryAccess,
    saved: Option<(Gfn, MemoryAccess)>,
}

impl ProtectionGuard {
    /// Creates a guard granting `access` in addition to the current one.
    pub fn new(access: MemoryAccess) -> Self {
        Self {
            access,
            saved: None,
        }
    }
}

impl<Driver> InterruptGuard<Driver> for ProtectionGuard
where
    Driver: VmiDriver,
{
    fn setup(&mut self, vmi: &VmiCore<Driver>, address: Pa) -> Result<(), VmiError> {
        let gfn = Driver::Architecture::gfn_from_pa(address);
        let current = vmi.memory_access(gfn)?;

        vmi.set_memory_access(gfn, current | self.access)?;
        self.saved = Some((gfn, current));

        tracing::debug!(%gfn, %current, relaxed = %(current | self.access), "memory access relaxed");
        Ok(())
    }

    fn teardown(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        if let Some((gfn, access)) = self.saved.take() {
            vmi.set_memory_access(gfn, access)?;
            tracing::debug!(%gfn, %access, "memory access restored");
        }

        Ok(())
    }
}
