//! Per-vCPU single-step callbacks.
//!
//! A breakpoint that has fired must let the original instruction execute
//! once before the breakpoint can be written back. The guest is therefore
//! single-stepped for exactly one instruction, and the callback scheduled
//! for the trapping vCPU re-arms the breakpoint afterwards.
//!
//! Each vCPU has at most one pending callback. Scheduling a second one for
//! the same vCPU replaces the first.

use std::{cell::RefCell, collections::HashMap};

use vmi_core::{VcpuId, VmiCore, VmiDriver, VmiError, VmiEventResponse};

/// A one-shot callback invoked after a single instruction has executed.
pub type SingleStepCallback<Driver> = Box<dyn FnOnce(&VmiCore<Driver>) -> Result<(), VmiError>>;

/// Registry of pending single-step callbacks, keyed by vCPU.
pub struct SingleStepSupervisor<Driver>
where
    Driver: VmiDriver,
{
    callbacks: RefCell<HashMap<VcpuId, SingleStepCallback<Driver>>>,
}

impl<Driver> Default for SingleStepSupervisor<Driver>
where
    Driver: VmiDriver,
{
    fn default() -> Self {
        Self {
            callbacks: RefCell::new(HashMap::new()),
        }
    }
}

impl<Driver> SingleStepSupervisor<Driver>
where
    Driver: VmiDriver,
{
    /// Creates an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run once `vcpu_id` has executed one
    /// instruction.
    pub fn schedule(
        &self,
        vcpu_id: VcpuId,
        callback: impl FnOnce(&VmiCore<Driver>) -> Result<(), VmiError> + 'static,
    ) {
        let previous = self
            .callbacks
            .borrow_mut()
            .insert(vcpu_id, Box::new(callback));

        if previous.is_some() {
            tracing::debug!(vcpu = %vcpu_id, "replacing pending single-step callback");
        }
    }

    /// Checks whether a callback is pending for the vCPU.
    pub fn is_pending(&self, vcpu_id: VcpuId) -> bool {
        self.callbacks.borrow().contains_key(&vcpu_id)
    }

    /// Returns the number of pending callbacks.
    pub fn pending(&self) -> usize {
        self.callbacks.borrow().len()
    }

    /// Drops every pending callback without running it.
    pub fn clear(&self) {
        self.callbacks.borrow_mut().clear();
    }

    /// Handles a single-step completion reported for `vcpu_id`.
    ///
    /// The pending callback, if any, is removed and invoked, and the
    /// response switches single-stepping off again. Without a pending
    /// callback the event is left alone, since single-stepping may be
    /// driven by someone else.
    pub fn handle(
        &self,
        vmi: &VmiCore<Driver>,
        vcpu_id: VcpuId,
    ) -> Result<VmiEventResponse, VmiError> {
        // Release the borrow before the callback runs, it may schedule again.
        let callback = self.callbacks.borrow_mut().remove(&vcpu_id);

        match callback {
            Some(callback) => {
                callback(vmi)?;
                Ok(VmiEventResponse::toggle_singlestep())
            }
            None => {
                tracing::trace!(vcpu = %vcpu_id, "no single-step callback pending");
                Ok(VmiEventResponse::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use vmi_arch_amd64::Amd64;
    use vmi_core::{
        os::OsType,
        testing::{MockDriver, make_vmi},
    };

    use super::*;

    type Driver = MockDriver<Amd64>;

    #[test]
    fn callback_runs_once() -> Result<(), VmiError> {
        let vmi = make_vmi(Driver::new(OsType::Linux))?;
        let supervisor = SingleStepSupervisor::<Driver>::new();
        let calls = Rc::new(Cell::new(0));

        supervisor.schedule(VcpuId(1), {
            let calls = calls.clone();
            move |_vmi| {
                calls.set(calls.get() + 1);
                Ok(())
            }
        });

        let response = supervisor.handle(&vmi, VcpuId(1))?;
        assert!(response.toggles_singlestep());
        assert_eq!(calls.get(), 1);

        // Consumed.
        let response = supervisor.handle(&vmi, VcpuId(1))?;
        assert!(!response.toggles_singlestep());
        assert_eq!(calls.get(), 1);
        Ok(())
    }

    #[test]
    fn vcpus_are_independent() -> Result<(), VmiError> {
        let vmi = make_vmi(Driver::new(OsType::Linux))?;
        let supervisor = SingleStepSupervisor::<Driver>::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for vcpu in [0u16, 1] {
            let order = order.clone();
            supervisor.schedule(VcpuId(vcpu), move |_vmi| {
                order.borrow_mut().push(vcpu);
                Ok(())
            });
        }

        supervisor.handle(&vmi, VcpuId(1))?;
        assert!(supervisor.is_pending(VcpuId(0)));
        assert!(!supervisor.is_pending(VcpuId(1)));

        supervisor.handle(&vmi, VcpuId(0))?;
        assert_eq!(*order.borrow(), [1, 0]);
        Ok(())
    }

    #[test]
    fn schedule_replaces_pending() -> Result<(), VmiError> {
        let vmi = make_vmi(Driver::new(OsType::Linux))?;
        let supervisor = SingleStepSupervisor::<Driver>::new();
        let which = Rc::new(Cell::new(""));

        for name in ["first", "second"] {
            let which = which.clone();
            supervisor.schedule(VcpuId(0), move |_vmi| {
                which.set(name);
                Ok(())
            });
        }

        assert_eq!(supervisor.pending(), 1);
        supervisor.handle(&vmi, VcpuId(0))?;
        assert_eq!(which.get(), "second");
        Ok(())
    }

    #[test]
    fn callback_error_propagates() -> Result<(), VmiError> {
        let vmi = make_vmi(Driver::new(OsType::Linux))?;
        let supervisor = SingleStepSupervisor::<Driver>::new();

        supervisor.schedule(VcpuId(0), |_vmi| Err(VmiError::Other("re-arm failed")));

        assert!(supervisor.handle(&vmi, VcpuId(0)).is_err());
        assert!(!supervisor.is_pending(VcpuId(0)));
        Ok(())
    }
}
