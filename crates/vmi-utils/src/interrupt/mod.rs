//! Software breakpoints multiplexed over one guest physical address space.
//!
//! An [`InterruptEvent`] replaces the instruction at a guest physical
//! address with the architecture's breakpoint instruction. When the guest
//! executes it, the driver reports a trap, and the [`InterruptController`]
//! routes the trap to the event registered at the trapping address.
//!
//! After the callback returns [`InterruptResponse::Continue`], the original
//! instruction is restored and the trapping vCPU is single-stepped over it.
//! Once the single-step completes, the breakpoint is written back:
//!
//! ```text
//! Uninitialized -> Armed -> (Triggered -> SingleStepPending -> Armed)* -> TornDown
//! ```
//!
//! Traps at addresses without a registered event are reinjected into the
//! guest, since they belong to someone else (a debugger inside the guest,
//! for example).
//!
//! At most one event can be registered at an address. Events are owned by
//! their creators; the controller only keeps weak references, and dropping
//! an event removes its dispatch entry.
//!
//! # Examples
//!
//! ```no_run
//! # use vmi_core::{VmiCore, VmiDriver, VmiError, Va, os::ProcessId};
//! # use vmi_utils::interrupt::{InterruptController, InterruptResponse};
//! # fn example<Driver: VmiDriver + 'static>(vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
//! let controller = InterruptController::new();
//! controller.initialize(vmi)?;
//!
//! let va = vmi.kernel_symbol("proc_exit_connector")?;
//! let root = vmi.translation_root(ProcessId(0))?;
//!
//! let _exit = controller.create_interrupt_event(vmi, "exit", (va, root), |ctx| {
//!     tracing::info!(vcpu = %ctx.vcpu_id(), "process exit");
//!     Ok(InterruptResponse::Continue)
//! })?;
//! # Ok(())
//! # }
//! ```

mod event;
mod guard;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use vmi_core::{
    AccessContext, Architecture as _, EventInterrupt as _, EventMonitor, EventReason as _, Pa,
    VcpuId, VmiCore, VmiDriver, VmiError, VmiEvent, VmiEventResponse,
};

pub use self::{
    event::{InterruptEvent, InterruptResponse, InterruptState},
    guard::{InterruptGuard, ProtectionGuard},
};
use crate::singlestep::SingleStepSupervisor;

/// The callback of an interrupt event.
pub type InterruptCallback<Driver> =
    Box<dyn FnMut(&InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError>>;

/// Everything an interrupt callback can inspect about the trap.
pub struct InterruptContext<'a, Driver>
where
    Driver: VmiDriver,
{
    vmi: &'a VmiCore<Driver>,
    event: &'a VmiEvent<Driver::Architecture>,
    name: &'a str,
    address: Pa,
}

impl<'a, Driver> InterruptContext<'a, Driver>
where
    Driver: VmiDriver,
{
    fn new(
        vmi: &'a VmiCore<Driver>,
        event: &'a VmiEvent<Driver::Architecture>,
        name: &'a str,
        address: Pa,
    ) -> Self {
        Self {
            vmi,
            event,
            name,
            address,
        }
    }

    /// Returns the VMI core.
    pub fn vmi(&self) -> &'a VmiCore<Driver> {
        self.vmi
    }

    /// Returns the event reported by the driver.
    pub fn event(&self) -> &'a VmiEvent<Driver::Architecture> {
        self.event
    }

    /// Returns the registers of the trapping vCPU.
    pub fn registers(&self) -> &'a <Driver::Architecture as vmi_core::Architecture>::Registers {
        self.event.registers()
    }

    /// Returns the ID of the trapping vCPU.
    pub fn vcpu_id(&self) -> VcpuId {
        self.event.vcpu_id()
    }

    /// Returns the guest physical address of the breakpoint.
    pub fn address(&self) -> Pa {
        self.address
    }

    /// Returns the name of the interrupt event.
    pub fn name(&self) -> &'a str {
        self.name
    }
}

struct Registration<Driver>
where
    Driver: VmiDriver,
{
    id: u64,
    interrupt: Weak<InterruptEvent<Driver>>,
}

struct Shared<Driver>
where
    Driver: VmiDriver,
{
    table: RefCell<HashMap<Pa, Registration<Driver>>>,
    next_id: Cell<u64>,
    singlestep: SingleStepSupervisor<Driver>,
}

/// Routes breakpoint and single-step events to interrupt events.
///
/// The controller is a cheap handle; clones share the same dispatch table.
pub struct InterruptController<Driver>
where
    Driver: VmiDriver,
{
    shared: Rc<Shared<Driver>>,
}

impl<Driver> Clone for InterruptController<Driver>
where
    Driver: VmiDriver,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Driver> Default for InterruptController<Driver>
where
    Driver: VmiDriver,
{
    fn default() -> Self {
        Self {
            shared: Rc::new(Shared {
                table: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
                singlestep: SingleStepSupervisor::new(),
            }),
        }
    }
}

impl<Driver> InterruptController<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a controller with an empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live interrupt events.
    pub fn len(&self) -> usize {
        self.shared
            .table
            .borrow()
            .values()
            .filter(|registration| registration.interrupt.strong_count() > 0)
            .count()
    }

    /// Checks whether no live interrupt event is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the interrupt event registered at `address`.
    pub fn interrupt_at(&self, address: Pa) -> Option<Rc<InterruptEvent<Driver>>> {
        self.shared
            .table
            .borrow()
            .get(&address)
            .and_then(|registration| registration.interrupt.upgrade())
    }

    /// Reads guest physical memory as it looks without the breakpoints.
    ///
    /// Bytes covered by an armed breakpoint are replaced with the original
    /// instruction bytes.
    pub fn read_original(
        &self,
        vmi: &VmiCore<Driver>,
        address: Pa,
        buffer: &mut [u8],
    ) -> Result<(), VmiError> {
        vmi.read(address, buffer)?;

        let start = address.0;
        let end = start + buffer.len() as u64;

        for (&pa, registration) in self.shared.table.borrow().iter() {
            let interrupt = match registration.interrupt.upgrade() {
                Some(interrupt) => interrupt,
                None => continue,
            };

            if !interrupt.state().breakpoint_written() {
                continue;
            }

            for (index, byte) in interrupt.original_bytes().into_iter().enumerate() {
                let pa = pa.0 + index as u64;
                if (start..end).contains(&pa) {
                    buffer[(pa - start) as usize] = byte;
                }
            }
        }

        Ok(())
    }

    /// Returns the single-step supervisor used for re-arming.
    pub fn singlestep(&self) -> &SingleStepSupervisor<Driver> {
        &self.shared.singlestep
    }

    fn next_id(&self) -> u64 {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        id
    }

    fn register(
        &self,
        address: Pa,
        id: u64,
        interrupt: Weak<InterruptEvent<Driver>>,
    ) -> Result<(), VmiError> {
        let mut table = self.shared.table.borrow_mut();

        if let Some(registration) = table.get(&address) {
            if registration.id != id && registration.interrupt.strong_count() > 0 {
                return Err(VmiError::BreakpointAlreadyRegistered(address));
            }
        }

        table.insert(address, Registration { id, interrupt });
        Ok(())
    }

    fn unregister(&self, id: u64, address: Pa) {
        let mut table = self.shared.table.borrow_mut();
        if table.get(&address).is_some_and(|registration| registration.id == id) {
            table.remove(&address);
        }
    }
}

impl<Driver> InterruptController<Driver>
where
    Driver: VmiDriver + 'static,
{
    /// Enables breakpoint and single-step monitoring on the driver.
    pub fn initialize(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        vmi.monitor_enable(EventMonitor::Breakpoint)?;
        vmi.monitor_enable(EventMonitor::Singlestep)?;
        Ok(())
    }

    /// Creates and arms an interrupt event.
    ///
    /// A virtual address is translated to the guest physical address first.
    /// The returned event stays armed for as long as it is kept alive.
    pub fn create_interrupt_event(
        &self,
        vmi: &VmiCore<Driver>,
        name: &str,
        address: impl Into<AccessContext>,
        callback: impl FnMut(&InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError>
        + 'static,
    ) -> Result<Rc<InterruptEvent<Driver>>, VmiError> {
        self.create(vmi, name, address.into(), Box::new(callback), None)
    }

    /// Creates and arms an interrupt event guarded by `guard`.
    ///
    /// The guard is set up before the breakpoint is first written and torn
    /// down together with the event.
    pub fn create_guarded_interrupt_event(
        &self,
        vmi: &VmiCore<Driver>,
        name: &str,
        address: impl Into<AccessContext>,
        guard: impl InterruptGuard<Driver> + 'static,
        callback: impl FnMut(&InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError>
        + 'static,
    ) -> Result<Rc<InterruptEvent<Driver>>, VmiError> {
        self.create(
            vmi,
            name,
            address.into(),
            Box::new(callback),
            Some(Box::new(guard)),
        )
    }

    fn create(
        &self,
        vmi: &VmiCore<Driver>,
        name: &str,
        ctx: AccessContext,
        callback: InterruptCallback<Driver>,
        guard: Option<Box<dyn InterruptGuard<Driver>>>,
    ) -> Result<Rc<InterruptEvent<Driver>>, VmiError> {
        let address = vmi.translate_access_context(ctx)?;

        let interrupt = Rc::new(InterruptEvent::new(
            self.next_id(),
            name,
            address,
            callback,
            guard,
            self.clone(),
        ));

        interrupt.arm(vmi)?;

        tracing::info!(name, %address, "interrupt event created");
        Ok(interrupt)
    }

    /// Handles an event reported by the driver.
    ///
    /// Single-step completions go to the single-step supervisor. Breakpoint
    /// traps go to the interrupt event registered at the trapping address,
    /// or are reinjected into the guest if there is none.
    pub fn handle_event(
        &self,
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Driver::Architecture>,
    ) -> Result<VmiEventResponse, VmiError> {
        if event.reason().is_singlestep() {
            return self.shared.singlestep.handle(vmi, event.vcpu_id());
        }

        let address = match Driver::Architecture::trap_address(vmi, event)? {
            Some(address) => address,
            None => return Ok(VmiEventResponse::default()),
        };

        // The table must not stay borrowed while the callback runs.
        let interrupt = match self.interrupt_at(address) {
            Some(interrupt) => interrupt,
            None => {
                tracing::debug!(%address, vcpu = %event.vcpu_id(), "unhandled breakpoint, reinjecting");
                return Ok(VmiEventResponse::reinject_interrupt());
            }
        };

        tracing::trace!(name = interrupt.name(), %address, vcpu = %event.vcpu_id(), "breakpoint hit");

        let response = interrupt.dispatch(vmi, event)?;

        let instruction_length = event
            .reason()
            .as_software_breakpoint()
            .map(|interrupt| interrupt.instruction_length())
            .unwrap_or(Driver::Architecture::BREAKPOINT.len() as u8);

        let result = VmiEventResponse::default().and_set_instruction_length(instruction_length);
        match response {
            InterruptResponse::Continue => Ok(result.and_toggle_singlestep()),
            InterruptResponse::Stop => Ok(result),
        }
    }

    /// Restores every original instruction and stops event delivery.
    ///
    /// Every live interrupt event is torn down, even if some fail; the first
    /// error is returned.
    pub fn teardown(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let _pause_guard = vmi.pause_guard()?;

        let pending = vmi.events_pending();
        if pending > 0 {
            tracing::warn!(pending, "tearing down with pending events");
        }

        let interrupts: Vec<_> = self
            .shared
            .table
            .borrow()
            .values()
            .filter_map(|registration| registration.interrupt.upgrade())
            .collect();

        let mut result = Ok(());
        for interrupt in &interrupts {
            if let Err(err) = interrupt.teardown(vmi) {
                tracing::error!(
                    %err,
                    name = interrupt.name(),
                    address = %interrupt.address(),
                    "failed to tear down interrupt"
                );

                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        self.shared.table.borrow_mut().clear();
        self.shared.singlestep.clear();

        for option in [EventMonitor::Breakpoint, EventMonitor::Singlestep] {
            if let Err(err) = vmi.monitor_disable(option) {
                tracing::error!(%err, ?option, "failed to disable monitor");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }
}

/// Wraps `handler` so that it runs against `owner` for as long as the owner
/// is alive.
///
/// The returned callback holds only a weak reference. Once the owner is
/// gone, the callback logs a warning and stops the interrupt event.
pub fn with_owner<Driver, Owner>(
    owner: &Rc<Owner>,
    mut handler: impl FnMut(&Owner, &InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError>
    + 'static,
) -> impl FnMut(&InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError> + 'static
where
    Driver: VmiDriver + 'static,
    Owner: 'static,
{
    let owner = Rc::downgrade(owner);

    move |ctx: &InterruptContext<'_, Driver>| match owner.upgrade() {
        Some(owner) => handler(&owner, ctx),
        None => {
            tracing::warn!(name = ctx.name(), address = %ctx.address(), "interrupt owner is gone");
            Ok(InterruptResponse::Stop)
        }
    }
}
