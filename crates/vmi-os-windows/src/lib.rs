//! Windows process lifecycle supervision.
//!
//! Three kernel routines are hooked:
//!
//! - `PspInsertProcess` inserts a freshly created `EPROCESS` into the
//!   active process list.
//! - `MmCleanProcessAddressSpace` runs when a process exits, while its
//!   `EPROCESS` is still intact.
//! - `KeBugCheck2` runs when the kernel is about to crash. Monitoring a
//!   crashed guest is pointless, so the hook fails and the session ends.

mod arch;
mod error;
mod protection;
#[cfg(all(test, feature = "arch-amd64"))]
mod tests;

use std::{
    cell::{Ref, RefCell},
    rc::Rc,
};

use vmi_core::{
    PluginNotifier, Va, VmiCore, VmiDriver, VmiError,
    os::{ActiveProcesses, ProcessId, ProcessInspector, ProcessObject, SystemEventSupervisor},
};
use vmi_utils::interrupt::{
    InterruptContext, InterruptController, InterruptEvent, InterruptResponse, with_owner,
};

pub use self::{arch::ArchAdapter, error::WindowsError, protection::ProtectionValue};

/// PID of the `System` process.
const SYSTEM_PID: ProcessId = ProcessId(4);

/// Process lifecycle supervisor for Windows guests.
pub struct WindowsSystemEventSupervisor<Driver>
where
    Driver: VmiDriver,
{
    controller: InterruptController<Driver>,
    state: Rc<WindowsState<Driver>>,
    hooks: Vec<Rc<InterruptEvent<Driver>>>,
}

struct WindowsState<Driver>
where
    Driver: VmiDriver,
{
    processes: RefCell<ActiveProcesses<Driver>>,
    plugins: Rc<RefCell<dyn PluginNotifier>>,
}

type Hook<Driver> = fn(
    &WindowsState<Driver>,
    &InterruptContext<'_, Driver>,
) -> Result<InterruptResponse, VmiError>;

impl<Driver> WindowsSystemEventSupervisor<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter<Driver>,
{
    /// Creates a new supervisor.
    pub fn new(
        controller: InterruptController<Driver>,
        inspector: impl ProcessInspector<Driver> + 'static,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
    ) -> Self {
        Self {
            controller,
            state: Rc::new(WindowsState {
                processes: RefCell::new(ActiveProcesses::new(inspector)),
                plugins,
            }),
            hooks: Vec::new(),
        }
    }

    fn hook(
        &self,
        vmi: &VmiCore<Driver>,
        symbol: &'static str,
        handler: Hook<Driver>,
    ) -> Result<Rc<InterruptEvent<Driver>>, VmiError> {
        let va = vmi
            .kernel_symbol(symbol)
            .map_err(|err| WindowsError::SymbolNotFound {
                symbol,
                source: Box::new(err),
            })?;

        let root = vmi.translation_root(SYSTEM_PID)?;
        tracing::debug!(symbol, %va, %root, "hooking kernel routine");

        self.controller
            .create_interrupt_event(vmi, symbol, (va, root), with_owner(&self.state, handler))
    }
}

impl<Driver> SystemEventSupervisor<Driver> for WindowsSystemEventSupervisor<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn initialize(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        self.state.processes.borrow_mut().initialize(vmi)?;
        self.controller.initialize(vmi)?;

        let hooks: [(&'static str, Hook<Driver>); 3] = [
            ("PspInsertProcess", WindowsState::on_insert_process),
            ("MmCleanProcessAddressSpace", WindowsState::on_clean_address_space),
            ("KeBugCheck2", WindowsState::on_bug_check),
        ];

        for (symbol, handler) in hooks {
            let hook = self.hook(vmi, symbol, handler)?;
            self.hooks.push(hook);
        }

        tracing::info!(hooks = self.hooks.len(), "windows system event supervisor initialized");
        Ok(())
    }

    fn teardown(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let result = self.controller.teardown(vmi);
        self.hooks.clear();
        result
    }

    fn active_processes(&self) -> Ref<'_, ActiveProcesses<Driver>> {
        self.state.processes.borrow()
    }
}

impl<Driver> WindowsState<Driver>
where
    Driver: VmiDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn eprocess(
        ctx: &InterruptContext<'_, Driver>,
        hook: &'static str,
    ) -> Result<ProcessObject, VmiError> {
        let process = Driver::Architecture::function_argument(ctx.vmi(), ctx.registers(), 0)?;

        let object = ProcessObject(Va(process));
        if object.is_null() {
            return Err(WindowsError::NullProcess { hook }.into());
        }

        Ok(object)
    }

    #[tracing::instrument(name = "process_create", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_insert_process(
        &self,
        ctx: &InterruptContext<'_, Driver>,
    ) -> Result<InterruptResponse, VmiError> {
        let object = Self::eprocess(ctx, "PspInsertProcess")?;

        match self.processes.borrow_mut().add_process(ctx.vmi(), object) {
            Ok(_) => {}
            Err(VmiError::PageFault(pfs)) => {
                tracing::warn!(%object, ?pfs, "EPROCESS not accessible");
            }
            Err(err) => return Err(err),
        }

        Ok(InterruptResponse::Continue)
    }

    #[tracing::instrument(name = "process_exit", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_clean_address_space(
        &self,
        ctx: &InterruptContext<'_, Driver>,
    ) -> Result<InterruptResponse, VmiError> {
        let object = Self::eprocess(ctx, "MmCleanProcessAddressSpace")?;

        let process = self.processes.borrow().process(object).cloned();
        let notified = match &process {
            Some(process) => self.plugins.borrow_mut().on_process_termination(process),
            None => Ok(()),
        };

        self.processes.borrow_mut().remove_process(object);
        notified?;

        Ok(InterruptResponse::Continue)
    }

    #[tracing::instrument(name = "bug_check", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_bug_check(
        &self,
        ctx: &InterruptContext<'_, Driver>,
    ) -> Result<InterruptResponse, VmiError> {
        let code = Driver::Architecture::function_argument(ctx.vmi(), ctx.registers(), 0)? as u32;

        tracing::error!(code = format_args!("0x{code:08x}"), "guest bug check");
        Err(WindowsError::BugCheck { code }.into())
    }
}
