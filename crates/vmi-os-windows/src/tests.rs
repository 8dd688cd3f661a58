use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use vmi_arch_amd64::{Amd64, EventInterrupt, EventReason, EventSinglestep, PageTableLevel, Registers};
use vmi_core::{
    Architecture as _, Pa, Va, VcpuId, VmiCore, VmiError, VmiEvent,
    os::{ActiveProcess, OsType, ProcessId, ProcessObject, SystemEventSupervisor},
    testing::{MockDriver, MockProcessInspector, Notification, RecordingNotifier, make_vmi},
};
use vmi_utils::interrupt::InterruptController;

use super::*;

type Driver = MockDriver<Amd64>;

const ROOT: Pa = Pa(0x1ad000);
const NTOSKRNL: Va = Va(0xfffff807_6a400000);

const INSERT: (Va, Pa) = (Va(NTOSKRNL.0 + 0x1000), Pa(0x1000));
const CLEAN: (Va, Pa) = (Va(NTOSKRNL.0 + 0x2000), Pa(0x2000));
const BUGCHECK: (Va, Pa) = (Va(NTOSKRNL.0 + 0x3000), Pa(0x3000));

const SYSTEM: ProcessObject = ProcessObject(Va(0xffffa301_0b2f6040));
const EXPLORER: ProcessObject = ProcessObject(Va(0xffffa301_1c4a0080));

struct Guest {
    vmi: VmiCore<Driver>,
    controller: InterruptController<Driver>,
    inspector: MockProcessInspector,
    notifier: RecordingNotifier,
}

fn map_page(driver: &Driver, va: Va, pa: Pa) {
    let chain = [
        (ROOT, PageTableLevel::Pml4, 0x1ae000),
        (Pa(0x1ae000), PageTableLevel::Pdpt, 0x1af000),
        (Pa(0x1af000), PageTableLevel::Pd, 0x1b0000),
        (Pa(0x1b0000), PageTableLevel::Pt, pa.0),
    ];

    for (table, level, next) in chain {
        let entry = table + Amd64::va_index_for(va, level) * 8;
        driver.write_memory(entry, &(next | 0b11).to_le_bytes());
    }
}

fn guest() -> Result<Guest, VmiError> {
    let driver = Driver::new(OsType::Windows);
    driver.set_translation_root(SYSTEM_PID, ROOT);

    for (symbol, (va, pa)) in [
        ("PspInsertProcess", INSERT),
        ("MmCleanProcessAddressSpace", CLEAN),
        ("KeBugCheck2", BUGCHECK),
    ] {
        driver.add_symbol(symbol, va);
        map_page(&driver, va, pa);

        // mov [rsp+8], rbx
        driver.write_memory(pa, &[0x48, 0x89, 0x5c, 0x24, 0x08]);
    }

    let inspector = MockProcessInspector::new();
    inspector.insert(SYSTEM, SYSTEM_PID, "System");

    Ok(Guest {
        vmi: make_vmi(driver)?,
        controller: InterruptController::new(),
        inspector,
        notifier: RecordingNotifier::new(),
    })
}

fn supervisor(guest: &Guest) -> WindowsSystemEventSupervisor<Driver> {
    let plugins: Rc<RefCell<dyn PluginNotifier>> = Rc::new(RefCell::new(guest.notifier.clone()));
    WindowsSystemEventSupervisor::new(guest.controller.clone(), guest.inspector.clone(), plugins)
}

fn call(guest: &Guest, hook: (Va, Pa), argument: u64) -> Result<(), VmiError> {
    let (va, pa) = hook;

    let registers = Registers {
        rip: va.0,
        rcx: argument,
        cr3: ROOT.0,
        ..Default::default()
    };

    let trap = VmiEvent::new(
        VcpuId(2),
        registers,
        EventReason::Breakpoint(EventInterrupt {
            gfn: Amd64::gfn_from_pa(pa),
            instruction_length: 1,
        }),
    );
    guest.controller.handle_event(&guest.vmi, &trap)?;

    let step = VmiEvent::new(
        VcpuId(2),
        registers,
        EventReason::Singlestep(EventSinglestep {
            gfn: Amd64::gfn_from_pa(pa),
        }),
    );
    guest.controller.handle_event(&guest.vmi, &step)?;
    Ok(())
}

// Looks the terminating process up in the live registry while the
// notification is delivered.
#[derive(Clone)]
struct RegistryWatcher {
    state: Rc<RefCell<Weak<WindowsState<Driver>>>>,
    observed: Rc<RefCell<Vec<(ProcessObject, bool)>>>,
}

impl RegistryWatcher {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(Weak::new())),
            observed: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn observed(&self) -> Vec<(ProcessObject, bool)> {
        self.observed.borrow().clone()
    }
}

impl PluginNotifier for RegistryWatcher {
    fn initialize_plugin(&mut self, _name: &str, _arguments: &[String]) -> Result<(), VmiError> {
        Ok(())
    }

    fn on_process_termination(&mut self, process: &ActiveProcess) -> Result<(), VmiError> {
        let registered = self
            .state
            .borrow()
            .upgrade()
            .is_some_and(|state| state.processes.borrow().contains(process.object));

        self.observed.borrow_mut().push((process.object, registered));
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<(), VmiError> {
        Ok(())
    }
}

fn registered(supervisor: &WindowsSystemEventSupervisor<Driver>) -> Vec<ProcessObject> {
    supervisor
        .active_processes()
        .iter()
        .map(|process| process.object)
        .collect()
}

#[test]
fn process_lifecycle() -> Result<(), VmiError> {
    let guest = guest()?;
    let mut supervisor = supervisor(&guest);
    supervisor.initialize(&guest.vmi)?;

    assert_eq!(guest.controller.len(), 3);
    assert_eq!(registered(&supervisor), [SYSTEM]);

    guest.inspector.insert(EXPLORER, ProcessId(4312), "explorer.exe");
    call(&guest, INSERT, EXPLORER.0.0)?;
    assert_eq!(registered(&supervisor), [SYSTEM, EXPLORER]);

    let explorer = supervisor.active_processes().process(EXPLORER).cloned();
    call(&guest, CLEAN, EXPLORER.0.0)?;

    assert_eq!(registered(&supervisor), [SYSTEM]);
    assert_eq!(
        guest.notifier.notifications(),
        explorer
            .map(Notification::ProcessTermination)
            .into_iter()
            .collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn plugins_see_registered_record_on_clean() -> Result<(), VmiError> {
    let guest = guest()?;

    let watcher = RegistryWatcher::new();
    let plugins: Rc<RefCell<dyn PluginNotifier>> = Rc::new(RefCell::new(watcher.clone()));
    let mut supervisor =
        WindowsSystemEventSupervisor::new(guest.controller.clone(), guest.inspector.clone(), plugins);
    *watcher.state.borrow_mut() = Rc::downgrade(&supervisor.state);
    supervisor.initialize(&guest.vmi)?;

    guest.inspector.insert(EXPLORER, ProcessId(4312), "explorer.exe");
    call(&guest, INSERT, EXPLORER.0.0)?;
    call(&guest, CLEAN, EXPLORER.0.0)?;

    assert_eq!(watcher.observed(), [(EXPLORER, true)]);
    assert!(!supervisor.active_processes().contains(EXPLORER));
    Ok(())
}

#[test]
fn inaccessible_eprocess_is_skipped() -> Result<(), VmiError> {
    let guest = guest()?;
    let mut supervisor = supervisor(&guest);
    supervisor.initialize(&guest.vmi)?;

    guest.inspector.insert_fault(EXPLORER, (EXPLORER.0, ROOT));
    call(&guest, INSERT, EXPLORER.0.0)?;

    assert_eq!(registered(&supervisor), [SYSTEM]);
    Ok(())
}

#[test]
fn null_eprocess_fails() -> Result<(), VmiError> {
    let guest = guest()?;
    let mut supervisor = supervisor(&guest);
    supervisor.initialize(&guest.vmi)?;

    let result = call(&guest, CLEAN, 0);
    assert!(matches!(result, Err(VmiError::Interrupt { .. })));
    assert_eq!(registered(&supervisor), [SYSTEM]);
    Ok(())
}

#[test]
fn bug_check_ends_monitoring() -> Result<(), VmiError> {
    let guest = guest()?;
    let mut supervisor = supervisor(&guest);
    supervisor.initialize(&guest.vmi)?;

    // CRITICAL_PROCESS_DIED, upper half of rcx is garbage.
    let result = call(&guest, BUGCHECK, 0xffff_ffff_0000_00ef);

    let source = match &result {
        Err(VmiError::Interrupt { name, source, .. }) => {
            assert_eq!(name, "KeBugCheck2");
            Some(source.to_string())
        }
        _ => None,
    };
    assert_eq!(source.as_deref(), Some("Guest bug check 0x000000ef"));
    Ok(())
}

#[test]
fn teardown_restores_kernel_code() -> Result<(), VmiError> {
    let guest = guest()?;
    let mut supervisor = supervisor(&guest);
    supervisor.initialize(&guest.vmi)?;

    supervisor.teardown(&guest.vmi)?;

    for (_, pa) in [INSERT, CLEAN, BUGCHECK] {
        assert_eq!(guest.vmi.driver().read_memory(pa, 2), [0x48, 0x89]);
    }
    assert!(guest.controller.is_empty());
    Ok(())
}
