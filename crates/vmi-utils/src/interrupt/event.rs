use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use vmi_core::{Architecture as _, Hex, Pa, VmiCore, VmiDriver, VmiError, VmiEvent};

use super::{InterruptCallback, InterruptContext, InterruptController, InterruptGuard};

/// Lifecycle state of an [`InterruptEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    /// Created, nothing written to the guest yet.
    Uninitialized,

    /// The breakpoint is written to guest memory.
    Armed,

    /// The breakpoint fired and the callback is running.
    Triggered,

    /// The original instruction is restored and waits for one single-step
    /// before the breakpoint is written back.
    SingleStepPending,

    /// The original instruction is restored; the event stays registered.
    Disarmed,

    /// The original instruction is restored and the event is no longer
    /// registered.
    TornDown,
}

impl InterruptState {
    /// Checks whether guest memory holds the breakpoint instead of the
    /// original instruction.
    pub fn breakpoint_written(self) -> bool {
        matches!(self, Self::Armed | Self::Triggered)
    }
}

/// Continuation decision returned by an interrupt callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptResponse {
    /// Keep monitoring: re-arm the breakpoint after one single-step.
    Continue,

    /// Stop monitoring: tear the interrupt event down.
    Stop,
}

/// A software breakpoint at one guest physical address.
///
/// Created through [`InterruptController::create_interrupt_event`] and owned
/// by whoever needs the notification. The controller only keeps a weak
/// reference for trap routing, which is removed when the event is dropped.
pub struct InterruptEvent<Driver>
where
    Driver: VmiDriver,
{
    id: u64,
    name: String,
    address: Pa,
    original: RefCell<Vec<u8>>,
    state: Cell<InterruptState>,
    callback: RefCell<InterruptCallback<Driver>>,
    guard: RefCell<Option<Box<dyn InterruptGuard<Driver>>>>,
    controller: InterruptController<Driver>,
}

impl<Driver> InterruptEvent<Driver>
where
    Driver: VmiDriver,
{
    pub(super) fn new(
        id: u64,
        name: &str,
        address: Pa,
        callback: InterruptCallback<Driver>,
        guard: Option<Box<dyn InterruptGuard<Driver>>>,
        controller: InterruptController<Driver>,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            address,
            original: RefCell::new(Vec::new()),
            state: Cell::new(InterruptState::Uninitialized),
            callback: RefCell::new(callback),
            guard: RefCell::new(guard),
            controller,
        }
    }

    /// Returns the name of the interrupt event.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the guest physical address of the breakpoint.
    pub fn address(&self) -> Pa {
        self.address
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> InterruptState {
        self.state.get()
    }

    /// Returns the instruction bytes the breakpoint replaced.
    ///
    /// Empty until the event is first armed.
    pub fn original_bytes(&self) -> Vec<u8> {
        self.original.borrow().clone()
    }
}

impl<Driver> InterruptEvent<Driver>
where
    Driver: VmiDriver + 'static,
{
    /// Writes the breakpoint to guest memory.
    ///
    /// The first time, the original instruction is saved and the event is
    /// registered with the controller. This fails if the original
    /// instruction already is a breakpoint, or if another event is
    /// registered at the same address.
    pub fn arm(self: &Rc<Self>, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let first = match self.state.get() {
            InterruptState::Armed | InterruptState::Triggered => return Ok(()),
            InterruptState::Uninitialized | InterruptState::TornDown => {
                self.register(vmi)?;
                true
            }
            InterruptState::SingleStepPending | InterruptState::Disarmed => false,
        };

        if let Err(err) = vmi.write(self.address, Driver::Architecture::BREAKPOINT) {
            if first {
                self.release(vmi);
            }
            return Err(err);
        }

        vmi.flush_caches();
        self.state.set(InterruptState::Armed);

        tracing::debug!(name = %self.name, address = %self.address, "breakpoint armed");
        Ok(())
    }

    /// Restores the original instruction.
    ///
    /// The event stays registered with the controller.
    pub fn disarm(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        if !self.state.get().breakpoint_written() {
            return Ok(());
        }

        let original = self.original.borrow();
        vmi.write(self.address, &original)?;
        vmi.flush_caches();
        self.state.set(InterruptState::Disarmed);

        tracing::debug!(
            name = %self.name,
            address = %self.address,
            original = %Hex(original.as_slice()),
            "breakpoint disarmed"
        );
        Ok(())
    }

    /// Disarms the event, releases its guard and unregisters it from the
    /// controller.
    ///
    /// Every step is attempted; the first error is returned.
    pub fn teardown(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let mut result = self.disarm(vmi);

        if let Some(guard) = self.guard.borrow_mut().as_mut() {
            let guard_result = guard.teardown(vmi);
            if result.is_ok() {
                result = guard_result;
            }
        }

        self.controller.unregister(self.id, self.address);
        self.state.set(InterruptState::TornDown);

        tracing::debug!(name = %self.name, address = %self.address, "interrupt torn down");
        result
    }

    fn register(self: &Rc<Self>, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let breakpoint = Driver::Architecture::BREAKPOINT;
        let offset = Driver::Architecture::pa_offset(self.address);
        if offset + breakpoint.len() as u64 > Driver::Architecture::PAGE_SIZE {
            return Err(VmiError::OutOfBounds);
        }

        self.controller
            .register(self.address, self.id, Rc::downgrade(self))?;

        if let Err(err) = self.prepare(vmi) {
            self.controller.unregister(self.id, self.address);
            return Err(err);
        }

        Ok(())
    }

    // Undoes `register` after the breakpoint could not be written.
    fn release(&self, vmi: &VmiCore<Driver>) {
        if let Some(guard) = self.guard.borrow_mut().as_mut() {
            if let Err(err) = guard.teardown(vmi) {
                tracing::error!(%err, name = %self.name, address = %self.address, "failed to release guard");
            }
        }

        self.controller.unregister(self.id, self.address);
    }

    fn prepare(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let breakpoint = Driver::Architecture::BREAKPOINT;

        vmi.flush_caches();

        let mut original = vec![0; breakpoint.len()];
        vmi.read(self.address, &mut original)?;

        if original == breakpoint {
            return Err(VmiError::BreakpointAlreadyPresent(self.address));
        }

        if let Some(guard) = self.guard.borrow_mut().as_mut() {
            guard.setup(vmi, self.address)?;
        }

        tracing::debug!(
            name = %self.name,
            address = %self.address,
            original = %Hex(original.as_slice()),
            "original instruction saved"
        );

        *self.original.borrow_mut() = original;
        Ok(())
    }

    /// Runs the callback for a trap at this event's address.
    pub(super) fn dispatch(
        self: &Rc<Self>,
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Driver::Architecture>,
    ) -> Result<InterruptResponse, VmiError> {
        vmi.flush_caches();
        self.state.set(InterruptState::Triggered);

        let ctx = InterruptContext::new(vmi, event, &self.name, self.address);
        let response = match self.callback.try_borrow_mut() {
            Ok(mut callback) => (*callback)(&ctx),
            Err(_) => Err(VmiError::Other("interrupt callback re-entered")),
        }
        .map_err(|err| VmiError::interrupt(&self.name, self.address, err))?;

        self.disarm(vmi)?;

        match response {
            InterruptResponse::Continue => {
                self.state.set(InterruptState::SingleStepPending);
                self.schedule_rearm(event);
            }
            InterruptResponse::Stop => self.teardown(vmi)?,
        }

        Ok(response)
    }

    fn schedule_rearm(self: &Rc<Self>, event: &VmiEvent<Driver::Architecture>) {
        let interrupt = Rc::downgrade(self);

        self.controller
            .singlestep()
            .schedule(event.vcpu_id(), move |vmi| rearm(&interrupt, vmi));
    }
}

fn rearm<Driver>(interrupt: &Weak<InterruptEvent<Driver>>, vmi: &VmiCore<Driver>) -> Result<(), VmiError>
where
    Driver: VmiDriver + 'static,
{
    let interrupt = match interrupt.upgrade() {
        Some(interrupt) => interrupt,
        None => return Ok(()),
    };

    // Torn down, or disarmed on purpose, while the single-step was pending.
    if interrupt.state() != InterruptState::SingleStepPending {
        return Ok(());
    }

    interrupt.arm(vmi)
}

impl<Driver> Drop for InterruptEvent<Driver>
where
    Driver: VmiDriver,
{
    fn drop(&mut self) {
        self.controller.unregister(self.id, self.address);
    }
}

impl<Driver> std::fmt::Debug for InterruptEvent<Driver>
where
    Driver: VmiDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("InterruptEvent")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("state", &self.state.get())
            .finish()
    }
}
