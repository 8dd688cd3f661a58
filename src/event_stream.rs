/// Reports the monitor state to an external consumer.
///
/// The transport is up to the implementation.
pub trait EventStream {
    /// Announces that every hook is armed and the guest is running.
    fn send_ready_event(&self);

    /// Reports a failure that ends the session.
    fn send_error_event(&self, message: &str);
}

/// An [`EventStream`] that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventStream;

impl EventStream for TracingEventStream {
    fn send_ready_event(&self) {
        tracing::info!(target: "vmi_monitor::event_stream", "ready");
    }

    fn send_error_event(&self, message: &str) {
        tracing::error!(target: "vmi_monitor::event_stream", message, "error");
    }
}
