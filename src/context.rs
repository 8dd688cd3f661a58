use std::{
    cell::{Cell, RefCell},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use signal_hook::{
    SigId,
    consts::{SIGINT, SIGTERM},
};
use vmi_core::VmiError;

/// Exit status of a session that ended because of a failure.
pub const EXIT_FAILURE: i32 = 1;

/// Signals that end the session gracefully.
const SHUTDOWN_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// State of one monitoring session.
///
/// Holds the shutdown flag, the "run shutdown action" flag and the exit
/// status. Signal handlers only ever store the signal number into an
/// atomic; the session picks it up with [`poll_signal`] from the event
/// loop.
///
/// [`poll_signal`]: Self::poll_signal
pub struct SessionContext {
    pending_signal: Arc<AtomicUsize>,
    signal_handlers: RefCell<Vec<SigId>>,
    shutdown: Cell<bool>,
    shutdown_action: Cell<bool>,
    exit_status: Cell<i32>,
}

/// Delivers a signal to a [`SessionContext`] from any thread.
#[derive(Debug, Clone)]
pub struct SignalSender {
    pending_signal: Arc<AtomicUsize>,
}

impl SignalSender {
    /// Marks `signal` as received.
    pub fn raise(&self, signal: i32) {
        self.pending_signal.store(signal as usize, Ordering::SeqCst);
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Creates a fresh session: no shutdown requested, exit status `0`.
    pub fn new() -> Self {
        Self {
            pending_signal: Arc::new(AtomicUsize::new(0)),
            signal_handlers: RefCell::new(Vec::new()),
            shutdown: Cell::new(false),
            shutdown_action: Cell::new(false),
            exit_status: Cell::new(0),
        }
    }

    /// Installs the `SIGINT` and `SIGTERM` handlers.
    ///
    /// The handlers are removed when the context is dropped.
    pub fn install_signal_handlers(&self) -> Result<(), VmiError> {
        let mut handlers = self.signal_handlers.borrow_mut();

        for signal in SHUTDOWN_SIGNALS {
            let id = signal_hook::flag::register_usize(
                signal,
                self.pending_signal.clone(),
                signal as usize,
            )?;

            handlers.push(id);
        }

        tracing::debug!(signals = ?SHUTDOWN_SIGNALS, "signal handlers installed");
        Ok(())
    }

    /// Returns a handle that can deliver signals to this context.
    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            pending_signal: self.pending_signal.clone(),
        }
    }

    /// Consumes a pending signal, if any.
    ///
    /// `SIGINT` and `SIGTERM` request a shutdown with exit status
    /// `128 + signal`. Any other signal is logged and ignored.
    ///
    /// Returns `true` if a shutdown is requested.
    pub fn poll_signal(&self) -> bool {
        let signal = self.pending_signal.swap(0, Ordering::SeqCst) as i32;

        match signal {
            0 => {}
            SIGINT => {
                tracing::info!("SIGINT received");
                self.request_shutdown(128 + signal);
            }
            SIGTERM => {
                tracing::info!("SIGTERM received");
                self.request_shutdown(128 + signal);
            }
            _ => {
                tracing::error!(signal, "unhandled signal received");
            }
        }

        self.is_shutdown_requested()
    }

    /// Requests a shutdown with the given exit status.
    pub fn request_shutdown(&self, exit_status: i32) {
        self.exit_status.set(exit_status);
        self.shutdown.set(true);
    }

    /// Requests a shutdown because of a failure.
    pub fn fail(&self) {
        self.request_shutdown(EXIT_FAILURE);
    }

    /// Checks whether a shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.get()
    }

    /// Sets whether plugins are notified of the shutdown.
    pub fn set_shutdown_action(&self, value: bool) {
        self.shutdown_action.set(value);
    }

    /// Checks whether plugins are notified of the shutdown.
    pub fn shutdown_action(&self) -> bool {
        self.shutdown_action.get()
    }

    /// Returns the exit status of the session.
    pub fn exit_status(&self) -> i32 {
        self.exit_status.get()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        for id in self.signal_handlers.get_mut().drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session() {
        let context = SessionContext::new();

        assert!(!context.poll_signal());
        assert!(!context.shutdown_action());
        assert_eq!(context.exit_status(), 0);
    }

    #[test]
    fn shutdown_signals() {
        for (signal, status) in [(SIGINT, 130), (SIGTERM, 143)] {
            let context = SessionContext::new();

            context.signal_sender().raise(signal);
            assert!(context.poll_signal());
            assert_eq!(context.exit_status(), status);
        }
    }

    #[test]
    fn other_signals_are_ignored() {
        let context = SessionContext::new();

        context.signal_sender().raise(signal_hook::consts::SIGUSR1);
        assert!(!context.poll_signal());
        assert_eq!(context.exit_status(), 0);
    }

    #[test]
    fn signal_is_consumed_once() {
        let context = SessionContext::new();

        context.signal_sender().raise(SIGINT);
        assert!(context.poll_signal());

        // The shutdown request persists after the signal is consumed.
        assert!(context.poll_signal());
        assert_eq!(context.exit_status(), 130);
    }

    #[test]
    fn failure_sets_status() {
        let context = SessionContext::new();
        context.fail();

        assert!(context.is_shutdown_requested());
        assert_eq!(context.exit_status(), EXIT_FAILURE);
    }

    #[test]
    fn sender_is_send() {
        fn assert_send<T: Send + Sync>(_: &T) {}

        let context = SessionContext::new();
        assert_send(&context.signal_sender());
    }
}
