use std::{cell::RefCell, rc::Rc};

use signal_hook::consts::{SIGINT, SIGTERM};
use vmi_arch_amd64::{Amd64, EventInterrupt, EventReason, EventSinglestep, PageTableLevel, Registers};
use vmi_core::{
    Architecture as _, EventMonitor, Pa, Va, VcpuId, VmiError, VmiEvent,
    os::{OsType, ProcessId, ProcessObject},
    testing::{MockDriver, MockProcessInspector, Notification, RecordingNotifier, make_vmi},
};
use vmi_utils::interrupt::{InterruptContext, InterruptResponse};

use super::*;
use crate::{EXIT_FAILURE, PluginConfig};

type Driver = MockDriver<Amd64>;

const ROOT: Pa = Pa(0x10_0000);
const TEXT: Va = Va(0xffff_ffff_8100_0000);

const FORK: (Va, Pa) = (Va(TEXT.0), Pa(0x1000));
const EXEC: (Va, Pa) = (Va(TEXT.0 + 0x1000), Pa(0x2000));
const EXIT: (Va, Pa) = (Va(TEXT.0 + 0x2000), Pa(0x3000));

// endbr64
const CODE: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];

const INIT: ProcessObject = ProcessObject(Va(0xffff_8880_0100_0000));
const SSHD: ProcessObject = ProcessObject(Va(0xffff_8880_0200_0000));

#[derive(Clone, Default)]
struct RecordingEventStream {
    events: Rc<RefCell<Vec<String>>>,
}

impl RecordingEventStream {
    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

impl EventStream for RecordingEventStream {
    fn send_ready_event(&self) {
        self.events.borrow_mut().push("ready".into());
    }

    fn send_error_event(&self, message: &str) {
        self.events.borrow_mut().push(format!("error: {message}"));
    }
}

struct Session {
    monitor: Monitor<Driver>,
    inspector: MockProcessInspector,
    notifier: RecordingNotifier,
    stream: RecordingEventStream,
}

fn linux_driver() -> Driver {
    let driver = Driver::new(OsType::Linux);
    driver.set_translation_root(ProcessId(0), ROOT);

    for (symbol, (va, pa)) in [
        ("proc_fork_connector", FORK),
        ("proc_exec_connector", EXEC),
        ("proc_exit_connector", EXIT),
    ] {
        driver.add_symbol(symbol, va);
        driver.write_memory(pa, &CODE);

        let chain = [
            (ROOT, PageTableLevel::Pml4, 0x10_1000),
            (Pa(0x10_1000), PageTableLevel::Pdpt, 0x10_2000),
            (Pa(0x10_2000), PageTableLevel::Pd, 0x10_3000),
            (Pa(0x10_3000), PageTableLevel::Pt, pa.0),
        ];

        for (table, level, next) in chain {
            let entry = table + Amd64::va_index_for(va, level) * 8;
            driver.write_memory(entry, &(next | 0b11).to_le_bytes());
        }
    }

    driver
}

fn session(driver: Driver, config: MonitorConfig) -> Result<Session, VmiError> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let inspector = MockProcessInspector::new();
    inspector.insert(INIT, ProcessId(1), "init");

    let notifier = RecordingNotifier::new();
    let stream = RecordingEventStream::default();

    let plugins: Rc<RefCell<dyn PluginNotifier>> = Rc::new(RefCell::new(notifier.clone()));
    let factory = inspector.clone();

    let monitor = Monitor::new(make_vmi(driver)?, config, plugins, move |_os| {
        Ok(Box::new(factory.clone()))
    })
    .with_event_stream(stream.clone());

    Ok(Session {
        monitor,
        inspector,
        notifier,
        stream,
    })
}

fn config(plugins: &[&str]) -> MonitorConfig {
    MonitorConfig {
        plugins: plugins
            .iter()
            .map(|name| (name.to_string(), PluginConfig::default()))
            .collect(),
        ..Default::default()
    }
}

fn driver(session: &Session) -> &Driver {
    session.monitor.vmi().driver()
}

// Queues a trap at `hook` on vcpu 0 with `task` as the first argument,
// followed by its single-step completion.
fn push_call(session: &Session, hook: (Va, Pa), task: ProcessObject) {
    let (va, pa) = hook;

    let registers = Registers {
        rip: va.0,
        rdi: task.0.0,
        cr3: ROOT.0,
        ..Default::default()
    };

    driver(session).push_event(VmiEvent::new(
        VcpuId(0),
        registers,
        EventReason::Breakpoint(EventInterrupt {
            gfn: Amd64::gfn_from_pa(pa),
            instruction_length: 1,
        }),
    ));

    driver(session).push_event(VmiEvent::new(
        VcpuId(0),
        registers,
        EventReason::Singlestep(EventSinglestep {
            gfn: Amd64::gfn_from_pa(pa),
        }),
    ));
}

fn push_signal(session: &Session, signal: i32) {
    let sender = session.monitor.context().signal_sender();
    driver(session).push_call(move || sender.raise(signal));
}

fn assert_restored(session: &Session) {
    for (_, pa) in [FORK, EXEC, EXIT] {
        assert_eq!(driver(session).read_memory(pa, CODE.len()), CODE);
    }

    assert!(session.monitor.controller().is_empty());
    assert!(!driver(session).is_monitoring(EventMonitor::Breakpoint));
    assert!(!driver(session).is_monitoring(EventMonitor::Singlestep));
}

////////////////////////////////////////////////////////////////////////////////
// Lifecycle
////////////////////////////////////////////////////////////////////////////////

#[test]
fn sigint_ends_session() -> Result<(), VmiError> {
    let session = session(linux_driver(), config(&["template"]))?;

    session.inspector.insert(SSHD, ProcessId(412), "sshd");
    push_call(&session, FORK, SSHD);
    push_call(&session, EXIT, SSHD);
    push_signal(&session, SIGINT);

    let exit_status = session.monitor.run(&PluginArguments::new())?;
    assert_eq!(exit_status, 130);

    let notifications = session.notifier.notifications();
    assert_eq!(notifications.len(), 3);
    assert_eq!(
        notifications[0],
        Notification::Initialized {
            name: "template".into(),
            arguments: vec!["template".into()],
        }
    );
    assert!(matches!(
        &notifications[1],
        Notification::ProcessTermination(process) if process.object == SSHD
    ));
    assert_eq!(notifications[2], Notification::Shutdown);

    assert_eq!(session.stream.events(), ["ready"]);
    assert_restored(&session);
    Ok(())
}

#[test]
fn sigterm_after_timeouts() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;

    driver(&session).push_error(VmiError::Timeout);
    driver(&session).push_error(VmiError::Timeout);
    push_signal(&session, SIGTERM);

    assert_eq!(session.monitor.run(&PluginArguments::new())?, 143);
    assert_eq!(session.notifier.notifications(), [Notification::Shutdown]);
    Ok(())
}

#[test]
fn foreign_trap_is_reinjected() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;

    let registers = Registers {
        rip: 0xffff_ffff_8100_4123,
        cr3: ROOT.0,
        ..Default::default()
    };
    driver(&session).push_event(VmiEvent::new(
        VcpuId(1),
        registers,
        EventReason::Breakpoint(EventInterrupt {
            gfn: Amd64::gfn_from_pa(Pa(0x4000)),
            instruction_length: 1,
        }),
    ));
    push_signal(&session, SIGINT);

    assert_eq!(session.monitor.run(&PluginArguments::new())?, 130);

    let responses = driver(&session).responses();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].reinjects_interrupt());

    // Every pause is matched by a resume.
    assert_eq!(driver(&session).pause_count(), driver(&session).resume_count());
    Ok(())
}

#[test]
fn plugin_arguments_are_resolved() -> Result<(), VmiError> {
    let session = session(linux_driver(), config(&["template", "scanner"]))?;
    push_signal(&session, SIGINT);

    let mut arguments = PluginArguments::new();
    arguments.insert("scanner".into(), vec!["scanner".into(), "--dump".into()]);
    session.monitor.run(&arguments)?;

    let initialized = session
        .notifier
        .notifications()
        .into_iter()
        .filter_map(|notification| match notification {
            Notification::Initialized { name, arguments } => Some((name, arguments)),
            _ => None,
        })
        .collect::<Vec<_>>();

    assert_eq!(
        initialized,
        [
            ("template".to_string(), vec!["template".to_string()]),
            (
                "scanner".to_string(),
                vec!["scanner".to_string(), "--dump".to_string()]
            ),
        ]
    );
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Failures
////////////////////////////////////////////////////////////////////////////////

#[test]
fn driver_failure_exits_with_1() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;
    driver(&session).push_error(VmiError::Other("domain destroyed"));

    assert_eq!(session.monitor.run(&PluginArguments::new())?, EXIT_FAILURE);

    assert_eq!(session.stream.events(), ["ready", "error: domain destroyed"]);
    assert_eq!(session.notifier.notifications(), [Notification::Shutdown]);
    assert_restored(&session);
    Ok(())
}

#[test]
fn driver_failure_without_shutdown_action() -> Result<(), VmiError> {
    let config = MonitorConfig {
        shutdown_plugin_action: false,
        ..Default::default()
    };

    let session = session(linux_driver(), config)?;
    driver(&session).push_error(VmiError::Other("domain destroyed"));

    assert_eq!(session.monitor.run(&PluginArguments::new())?, EXIT_FAILURE);
    assert!(session.notifier.notifications().is_empty());
    assert_restored(&session);
    Ok(())
}

#[test]
fn callback_failure_exits_with_1() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;

    // The loop stops after the failing trap, the single-step is never
    // delivered.
    push_call(&session, FORK, ProcessObject(Va(0)));

    assert_eq!(session.monitor.run(&PluginArguments::new())?, EXIT_FAILURE);

    let events = session.stream.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].starts_with("error: Interrupt `proc_fork_connector` at 0x0000000000001000 failed"));
    assert_restored(&session);
    Ok(())
}

#[test]
fn failed_rearm_stops_single_stepping() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;
    let monitor = &session.monitor;
    let (va, pa) = FORK;

    let _interrupt = monitor.controller().create_interrupt_event(
        monitor.vmi(),
        "proc_fork_connector",
        pa,
        |_ctx: &InterruptContext<'_, Driver>| Ok(InterruptResponse::Continue),
    )?;

    let registers = Registers {
        rip: va.0,
        cr3: ROOT.0,
        ..Default::default()
    };

    let trap = VmiEvent::new(
        VcpuId(3),
        registers,
        EventReason::Breakpoint(EventInterrupt {
            gfn: Amd64::gfn_from_pa(pa),
            instruction_length: 1,
        }),
    );
    assert!(monitor.handle_event(&trap).toggles_singlestep());

    // The breakpoint cannot be written back after the single-step.
    driver(&session).set_read_only(true);

    let step = VmiEvent::new(
        VcpuId(3),
        registers,
        EventReason::Singlestep(EventSinglestep {
            gfn: Amd64::gfn_from_pa(pa),
        }),
    );
    assert!(monitor.handle_event(&step).toggles_singlestep());

    assert_eq!(monitor.context().exit_status(), EXIT_FAILURE);
    assert_eq!(session.stream.events(), ["error: guest memory is read-only"]);
    Ok(())
}

#[test]
fn exhausted_event_queue_is_a_failure() -> Result<(), VmiError> {
    let session = session(linux_driver(), MonitorConfig::default())?;
    assert_eq!(session.monitor.run(&PluginArguments::new())?, EXIT_FAILURE);
    Ok(())
}

#[test]
fn unknown_os_fails_startup() -> Result<(), VmiError> {
    let session = session(Driver::new(OsType::Unknown), config(&["template"]))?;

    let result = session.monitor.run(&PluginArguments::new());
    assert!(matches!(result, Err(VmiError::UnsupportedOs(OsType::Unknown))));

    // Plugins are never initialized for a guest that cannot be monitored.
    assert!(session.notifier.notifications().is_empty());
    assert!(session.stream.events().is_empty());
    Ok(())
}

#[test]
fn unmapped_hook_fails_startup() -> Result<(), VmiError> {
    let guest = linux_driver();
    guest.add_symbol("proc_exit_connector", Va(0xffff_ffff_8200_0000));

    let session = session(guest, MonitorConfig::default())?;
    let result = session.monitor.run(&PluginArguments::new());

    assert!(result.is_err());
    assert!(session.stream.events().is_empty());

    // The hooks armed before the failure are removed again.
    assert_restored(&session);
    assert_eq!(driver(&session).pause_count(), driver(&session).resume_count());
    Ok(())
}
