#[cfg(all(test, feature = "arch-amd64", feature = "os-linux"))]
mod tests;

use std::{cell::RefCell, rc::Rc};

use vmi_core::{
    Architecture as _, EventReason as _, PluginNotifier, VmiCore, VmiDriver, VmiError, VmiEvent, VmiEventResponse,
    os::{OsType, SystemEventSupervisor},
};
use vmi_utils::interrupt::InterruptController;

use crate::{
    EventStream, MonitorConfig, PluginArguments, SessionContext, TracingEventStream,
    platform::{BoxedInspector, BoxedSupervisor, Platform},
};

/// Creates the process inspector for the reported guest operating system.
pub type InspectorFactory<Driver> = Box<dyn Fn(OsType) -> Result<BoxedInspector<Driver>, VmiError>>;

/// The session loop.
///
/// A monitor runs exactly one session:
///
/// 1. The system event supervisor for the guest OS is selected.
/// 2. Plugins are initialized.
/// 3. With the guest paused, the supervisor arms its hooks.
/// 4. Readiness is reported and signal handlers are installed.
/// 5. Guest events are processed until a signal arrives or something
///    fails.
/// 6. Plugins receive the shutdown notification (if enabled) and every
///    hook is removed from the guest.
///
/// Failures during steps 1-4 are returned as errors. Anything failing later
/// ends the session with exit status `1`.
pub struct Monitor<Driver>
where
    Driver: VmiDriver,
{
    vmi: VmiCore<Driver>,
    config: MonitorConfig,
    context: SessionContext,
    controller: InterruptController<Driver>,
    plugins: Rc<RefCell<dyn PluginNotifier>>,
    inspector: InspectorFactory<Driver>,
    event_stream: Box<dyn EventStream>,
}

impl<Driver> Monitor<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: Platform,
{
    /// Creates a new monitor.
    pub fn new(
        vmi: VmiCore<Driver>,
        config: MonitorConfig,
        plugins: Rc<RefCell<dyn PluginNotifier>>,
        inspector: impl Fn(OsType) -> Result<BoxedInspector<Driver>, VmiError> + 'static,
    ) -> Self {
        Self {
            vmi,
            config,
            context: SessionContext::new(),
            controller: InterruptController::new(),
            plugins,
            inspector: Box::new(inspector),
            event_stream: Box::new(TracingEventStream),
        }
    }

    /// Replaces the event stream readiness and failures are reported to.
    pub fn with_event_stream(self, event_stream: impl EventStream + 'static) -> Self {
        Self {
            event_stream: Box::new(event_stream),
            ..self
        }
    }

    /// Returns the VMI core.
    pub fn vmi(&self) -> &VmiCore<Driver> {
        &self.vmi
    }

    /// Returns the session context.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Returns the interrupt controller shared by every hook.
    pub fn controller(&self) -> &InterruptController<Driver> {
        &self.controller
    }

    /// Runs the session and returns its exit status.
    pub fn run(&self, arguments: &PluginArguments) -> Result<i32, VmiError> {
        let mut supervisor = self.create_supervisor()?;
        self.initialize_plugins(arguments)?;

        if let Err(err) = self.start(supervisor.as_mut()) {
            self.teardown(supervisor.as_mut());
            return Err(err);
        }

        self.wait_for_events();

        if self.context.shutdown_action() {
            self.shutdown_plugins();
        }

        self.teardown(supervisor.as_mut());

        let exit_status = self.context.exit_status();
        tracing::info!(exit_status, "monitor stopped");
        Ok(exit_status)
    }

    fn create_supervisor(&self) -> Result<BoxedSupervisor<Driver>, VmiError> {
        let info = self.vmi.info()?;
        let os = self.vmi.os_type()?;

        tracing::info!(
            %os,
            architecture = Driver::Architecture::NAME,
            vcpus = info.vcpus,
            max_gfn = %info.max_gfn,
            "starting monitor"
        );

        let inspector = (self.inspector)(os)?;
        Driver::Architecture::system_event_supervisor(
            os,
            self.controller.clone(),
            inspector,
            self.plugins.clone(),
        )
    }

    fn initialize_plugins(&self, arguments: &PluginArguments) -> Result<(), VmiError> {
        for name in self.config.plugins.keys() {
            let arguments = self.config.plugin_arguments(name, arguments);
            tracing::debug!(name, ?arguments, "initializing plugin");

            self.plugins
                .borrow_mut()
                .initialize_plugin(name, &arguments)?;
        }

        Ok(())
    }

    fn start(&self, supervisor: &mut dyn SystemEventSupervisor<Driver>) -> Result<(), VmiError> {
        {
            // No vCPU may run into a half-written hook.
            let _pause_guard = self.vmi.pause_guard()?;
            supervisor.initialize(&self.vmi)?;
        }

        self.event_stream.send_ready_event();
        self.context.install_signal_handlers()
    }

    fn wait_for_events(&self) {
        self.context
            .set_shutdown_action(self.config.shutdown_plugin_action);

        let timeout = self.config.event_timeout();

        while !self.context.poll_signal() {
            match self
                .vmi
                .wait_for_event(timeout, |event| self.handle_event(event))
            {
                Ok(()) => {}
                Err(err) if err.is_benign_wait_error() => {
                    tracing::trace!(%err, "wait returned without event");
                }
                Err(err) => {
                    self.report_failure("error while waiting for events", &err);
                }
            }
        }
    }

    fn handle_event(&self, event: &VmiEvent<Driver::Architecture>) -> VmiEventResponse {
        match self.controller.handle_event(&self.vmi, event) {
            Ok(response) => response,
            Err(err) => {
                self.report_failure("error while handling event", &err);

                // Only a scheduled callback can fail a single-step, so
                // single-stepping is on for this vCPU.
                if event.reason().is_singlestep() {
                    VmiEventResponse::toggle_singlestep()
                } else {
                    VmiEventResponse::default()
                }
            }
        }
    }

    fn report_failure(&self, message: &'static str, err: &VmiError) {
        let chain = error_chain(err);

        tracing::error!(err = %chain, "{message}");
        self.event_stream.send_error_event(&chain);
        self.context.fail();
    }

    fn shutdown_plugins(&self) {
        let result = self
            .vmi
            .pause_guard()
            .and_then(|_pause_guard| self.plugins.borrow_mut().on_shutdown());

        if let Err(err) = result {
            tracing::error!(err = %error_chain(&err), "plugin shutdown failed");
        }
    }

    fn teardown(&self, supervisor: &mut dyn SystemEventSupervisor<Driver>) {
        if let Err(err) = supervisor.teardown(&self.vmi) {
            tracing::error!(err = %error_chain(&err), "teardown failed");
        }
    }
}

/// Formats an error followed by all of its sources.
fn error_chain(err: &VmiError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);

    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }

    message
}
