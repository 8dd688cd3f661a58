//! Linux process lifecycle supervision.
//!
//! The kernel reports process creation and termination to the process
//! events connector (`drivers/connector/cn_proc.c`). Hooking the three
//! notification entry points is enough to keep a registry of live
//! processes:
//!
//! - `proc_fork_connector(struct task_struct *task)`
//! - `proc_exec_connector(struct task_struct *task)`
//! - `proc_exit_connector(struct task_struct *task)`
//!
//! The functions exist regardless of whether the connector is used by any
//! userspace listener.

mod arch;
mod error;

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

pub use self::{arch::ArchAdapter, error::LinuxError};

/// PID whose address space maps the kernel.
const KERNEL_PID: ProcessId = ProcessId(0);

/// Process lifecycle supervisor for Linux guests.
pub struct LinuxSystemEventSupervisor<Driver>
where
    Driver: VmiDriver,
{
    controller: InterruptController<Driver>,
    state: Rc<LinuxState<Driver>>,
    hooks: Vec<Rc<InterruptEvent<Driver>>>,
}

/// State shared with the hook callbacks.
struct LinuxState<Driver>
where
    Driver: VmiDriver,
{
    processes: RefCell<ActiveProcesses<Driver>>,
    plugins: Rc<RefCell<dyn PluginNotifier>>,
}

type Hook<Driver> = fn(
    &LinuxState<Driver>,
    &InterruptContext<'_, Driver>,
) -> Result<InterruptResponse, VmiError>;

impl<Driver> LinuxSystemEventSupervisor<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter<Driver>,
{
    /// Creates a new supervisor.
    ///
    /// Nothing is hooked until [`initialize`] is called.
    ///
    /// [`initialize`]: SystemEventSupervisor::initialize
    pub fn new(
        controller: InterruptController<Driver>,
        inspector: impl ProcessInspector<Driver> + 'static,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
    ) -> Self {
        Self {
            controller,
            state: Rc::new(LinuxState {
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
            .map_err(|err| LinuxError::SymbolNotFound {
                symbol,
                source: Box::new(err),
            })?;

        let root = vmi.translation_root(KERNEL_PID)?;
        tracing::debug!(symbol, %va, %root, "hooking kernel function");

        self.controller
            .create_interrupt_event(vmi, symbol, (va, root), with_owner(&self.state, handler))
    }
}

impl<Driver> SystemEventSupervisor<Driver> for LinuxSystemEventSupervisor<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn initialize(&mut self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        self.state.processes.borrow_mut().initialize(vmi)?;
        self.controller.initialize(vmi)?;

        let hooks: [(&'static str, Hook<Driver>); 3] = [
            ("proc_fork_connector", LinuxState::on_fork),
            ("proc_exec_connector", LinuxState::on_exec),
            ("proc_exit_connector", LinuxState::on_exit),
        ];

        for (symbol, handler) in hooks {
            let hook = self.hook(vmi, symbol, handler)?;
            self.hooks.push(hook);
        }

        tracing::info!(hooks = self.hooks.len(), "linux system event supervisor initialized");
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

impl<Driver> LinuxState<Driver>
where
    Driver: VmiDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn task_struct(
        ctx: &InterruptContext<'_, Driver>,
        hook: &'static str,
    ) -> Result<ProcessObject, VmiError> {
        let task = Driver::Architecture::function_argument(ctx.vmi(), ctx.registers(), 0)?;

        let object = ProcessObject(Va(task));
        if object.is_null() {
            return Err(LinuxError::NullTaskStruct { hook }.into());
        }

        Ok(object)
    }

    fn add(&self, ctx: &InterruptContext<'_, Driver>, hook: &'static str) -> Result<(), VmiError> {
        let object = Self::task_struct(ctx, hook)?;

        match self.processes.borrow_mut().add_process(ctx.vmi(), object) {
            Ok(_) => Ok(()),
            Err(VmiError::PageFault(pfs)) => {
                tracing::warn!(%object, ?pfs, hook, "task_struct not accessible");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(name = "proc_fork", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_fork(&self, ctx: &InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError> {
        self.add(ctx, "proc_fork_connector")?;
        Ok(InterruptResponse::Continue)
    }

    #[tracing::instrument(name = "proc_exec", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_exec(&self, ctx: &InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError> {
        self.add(ctx, "proc_exec_connector")?;
        Ok(InterruptResponse::Continue)
    }

    #[tracing::instrument(name = "proc_exit", skip_all, fields(vcpu = %ctx.vcpu_id()))]
    fn on_exit(&self, ctx: &InterruptContext<'_, Driver>) -> Result<InterruptResponse, VmiError> {
        let object = Self::task_struct(ctx, "proc_exit_connector")?;

        // The record stays registered while the plugins look at it.
        let process = self.processes.borrow().process(object).cloned();
        let notified = match &process {
            Some(process) => self.plugins.borrow_mut().on_process_termination(process),
            None => Ok(()),
        };

        self.processes.borrow_mut().remove_process(object);
        notified?;

        Ok(InterruptResponse::Continue)
    }
}
