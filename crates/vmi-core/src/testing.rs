//! Test doubles for the driver, the process inspector and the plugin
//! notifier.
//!
//! Enabled with the `test-utils` feature.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
    time::Duration,
};

use indexmap::IndexMap;

use crate::{
    Architecture, EventInterrupt, EventMonitor, EventReason, Gfn, MemoryAccess, PageFault,
    Pa, PluginNotifier, Registers, Va, VmiCore, VmiDriver, VmiError, VmiEvent, VmiEventResponse,
    VmiInfo, VmiMappedPage,
    os::{ActiveProcess, OsType, ProcessId, ProcessInspector, ProcessObject},
};

////////////////////////////////////////////////////////////////////////////////
// Architecture
////////////////////////////////////////////////////////////////////////////////

/// A minimal architecture with identity address translation.
#[derive(Debug)]
pub struct TestArch;

/// Registers of [`TestArch`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestRegisters {
    /// Instruction pointer.
    pub ip: u64,

    /// Stack pointer.
    pub sp: u64,

    /// Translation root.
    pub root: u64,

    /// Argument registers.
    pub arguments: [u64; 4],
}

impl Registers for TestRegisters {
    fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    fn translation_root(&self, _va: Va) -> Pa {
        Pa(self.root)
    }
}

/// A breakpoint event of [`TestArch`].
#[derive(Debug, Clone, Copy)]
pub struct TestInterrupt {
    /// GFN of the trapping instruction.
    pub gfn: Gfn,
}

impl EventInterrupt for TestInterrupt {
    fn gfn(&self) -> Gfn {
        self.gfn
    }

    fn instruction_length(&self) -> u8 {
        TestArch::BREAKPOINT.len() as u8
    }
}

/// Event reason of [`TestArch`].
#[derive(Debug, Clone, Copy)]
pub enum TestEventReason {
    /// Software breakpoint.
    Breakpoint(TestInterrupt),

    /// Single-step completion.
    Singlestep,
}

impl EventReason for TestEventReason {
    fn as_software_breakpoint(&self) -> Option<&impl EventInterrupt> {
        match self {
            Self::Breakpoint(interrupt) => Some(interrupt),
            Self::Singlestep => None,
        }
    }

    fn is_singlestep(&self) -> bool {
        matches!(self, Self::Singlestep)
    }
}

impl Architecture for TestArch {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = !0xfff;

    const BREAKPOINT: &'static [u8] = &[0xcc];

    const NAME: &'static str = "test";

    type Registers = TestRegisters;
    type PageTableLevel = ();
    type EventReason = TestEventReason;

    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }

    fn translate_address<Driver>(_vmi: &VmiCore<Driver>, va: Va, _root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        Ok(Pa(va.0))
    }

    fn trap_address<Driver>(
        _vmi: &VmiCore<Driver>,
        event: &VmiEvent<Self>,
    ) -> Result<Option<Pa>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        Ok(event.reason().as_software_breakpoint().map(|interrupt| {
            Self::pa_from_gfn(interrupt.gfn()) + Self::va_offset(Va(event.registers().ip))
        }))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Driver
////////////////////////////////////////////////////////////////////////////////

/// A scripted step of [`MockDriver::wait_for_event`].
pub enum MockStep<Arch>
where
    Arch: Architecture,
{
    /// Deliver the event to the handler.
    Event(VmiEvent<Arch>),

    /// Fail the wait with the error.
    Error(VmiError),

    /// Run the closure, then report the wait as interrupted.
    Call(Box<dyn FnOnce()>),
}

/// An in-memory driver with a scripted event queue.
///
/// Guest physical memory is sparse; pages come into existence when first
/// written. Once the event queue runs dry, `wait_for_event` fails, which
/// ends any session loop driven by the mock.
pub struct MockDriver<Arch>
where
    Arch: Architecture,
{
    os_type: OsType,
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    access: RefCell<HashMap<Gfn, MemoryAccess>>,
    symbols: RefCell<HashMap<String, Va>>,
    roots: RefCell<HashMap<ProcessId, Pa>>,
    steps: RefCell<VecDeque<MockStep<Arch>>>,
    responses: RefCell<Vec<VmiEventResponse>>,
    monitors: RefCell<HashSet<EventMonitor>>,
    pending: Cell<usize>,
    read_only: Cell<bool>,
    pauses: Cell<usize>,
    resumes: Cell<usize>,
}

impl<Arch> MockDriver<Arch>
where
    Arch: Architecture,
{
    /// Creates a driver reporting the given operating system.
    pub fn new(os_type: OsType) -> Self {
        Self {
            os_type,
            pages: RefCell::default(),
            access: RefCell::default(),
            symbols: RefCell::default(),
            roots: RefCell::default(),
            steps: RefCell::default(),
            responses: RefCell::default(),
            monitors: RefCell::default(),
            pending: Cell::new(0),
            read_only: Cell::new(false),
            pauses: Cell::new(0),
            resumes: Cell::new(0),
        }
    }

    /// Makes every subsequent `write_page` fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.set(read_only);
    }

    /// Writes bytes to guest physical memory, bypassing any cache.
    pub fn write_memory(&self, pa: Pa, content: &[u8]) {
        for (index, byte) in content.iter().enumerate() {
            let pa = pa + index as u64;
            let mut pages = self.pages.borrow_mut();
            let page = pages
                .entry(Arch::gfn_from_pa(pa))
                .or_insert_with(|| vec![0; Arch::PAGE_SIZE as usize]);
            page[Arch::pa_offset(pa) as usize] = *byte;
        }
    }

    /// Reads bytes from guest physical memory, bypassing any cache.
    ///
    /// Unmapped memory reads as zeros.
    pub fn read_memory(&self, pa: Pa, length: usize) -> Vec<u8> {
        let pages = self.pages.borrow();

        (0..length as u64)
            .map(|index| {
                let pa = pa + index;
                pages
                    .get(&Arch::gfn_from_pa(pa))
                    .map_or(0, |page| page[Arch::pa_offset(pa) as usize])
            })
            .collect()
    }

    /// Registers a kernel symbol.
    pub fn add_symbol(&self, name: &str, va: Va) {
        self.symbols.borrow_mut().insert(name.to_owned(), va);
    }

    /// Registers the translation root of a process.
    pub fn set_translation_root(&self, pid: ProcessId, root: Pa) {
        self.roots.borrow_mut().insert(pid, root);
    }

    /// Queues an event.
    pub fn push_event(&self, event: VmiEvent<Arch>) {
        self.steps.borrow_mut().push_back(MockStep::Event(event));
    }

    /// Queues a failure of the wait call.
    pub fn push_error(&self, err: VmiError) {
        self.steps.borrow_mut().push_back(MockStep::Error(err));
    }

    /// Queues a closure executed during the wait call.
    pub fn push_call(&self, f: impl FnOnce() + 'static) {
        self.steps.borrow_mut().push_back(MockStep::Call(Box::new(f)));
    }

    /// Sets the number of reported pending events.
    pub fn set_events_pending(&self, count: usize) {
        self.pending.set(count);
    }

    /// Returns the responses returned by the handler, in order.
    pub fn responses(&self) -> Vec<VmiEventResponse> {
        self.responses.borrow().clone()
    }

    /// Checks whether the given kind of events is being delivered.
    pub fn is_monitoring(&self, option: EventMonitor) -> bool {
        self.monitors.borrow().contains(&option)
    }

    /// Returns how many times the guest was paused.
    pub fn pause_count(&self) -> usize {
        self.pauses.get()
    }

    /// Returns how many times the guest was resumed.
    pub fn resume_count(&self) -> usize {
        self.resumes.get()
    }
}

impl<Arch> VmiDriver for MockDriver<Arch>
where
    Arch: Architecture,
{
    type Architecture = Arch;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            max_gfn: self.pages.borrow().keys().max().copied().unwrap_or_default(),
            vcpus: 4,
        })
    }

    fn os_type(&self) -> Result<OsType, VmiError> {
        Ok(self.os_type)
    }

    fn pause(&self) -> Result<(), VmiError> {
        self.pauses.set(self.pauses.get() + 1);
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        self.resumes.set(self.resumes.get() + 1);
        Ok(())
    }

    fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        Ok(self
            .access
            .borrow()
            .get(&gfn)
            .copied()
            .unwrap_or(MemoryAccess::RWX))
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.access.borrow_mut().insert(gfn, access);
        Ok(())
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        match self.pages.borrow().get(&gfn) {
            Some(page) => Ok(VmiMappedPage::new(page.clone())),
            None => Err(VmiError::OutOfBounds),
        }
    }

    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<VmiMappedPage, VmiError> {
        if self.read_only.get() {
            return Err(VmiError::Other("guest memory is read-only"));
        }

        let offset = offset as usize;
        if offset + content.len() > Arch::PAGE_SIZE as usize {
            return Err(VmiError::OutOfBounds);
        }

        let mut pages = self.pages.borrow_mut();
        let page = pages
            .entry(gfn)
            .or_insert_with(|| vec![0; Arch::PAGE_SIZE as usize]);
        page[offset..offset + content.len()].copy_from_slice(content);

        Ok(VmiMappedPage::new(page.clone()))
    }

    fn kernel_symbol(&self, name: &str) -> Result<Va, VmiError> {
        self.symbols
            .borrow()
            .get(name)
            .copied()
            .ok_or(VmiError::Other("symbol not found"))
    }

    fn translation_root(&self, pid: ProcessId) -> Result<Pa, VmiError> {
        self.roots
            .borrow()
            .get(&pid)
            .copied()
            .ok_or(VmiError::RootNotPresent)
    }

    fn monitor_enable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.monitors.borrow_mut().insert(option);
        Ok(())
    }

    fn monitor_disable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.monitors.borrow_mut().remove(&option);
        Ok(())
    }

    fn events_pending(&self) -> usize {
        self.pending.get()
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        mut handler: impl FnMut(&VmiEvent<Arch>) -> VmiEventResponse,
    ) -> Result<(), VmiError> {
        // The borrow must end before the handler runs, the handler may
        // queue further steps.
        let step = self.steps.borrow_mut().pop_front();

        match step {
            Some(MockStep::Event(event)) => {
                let response = handler(&event);
                self.responses.borrow_mut().push(response);
                Ok(())
            }
            Some(MockStep::Error(err)) => Err(err),
            Some(MockStep::Call(f)) => {
                f();
                Err(VmiError::Io(std::io::ErrorKind::Interrupted.into()))
            }
            None => Err(VmiError::Other("mock event queue exhausted")),
        }
    }
}

/// Creates a `VmiCore` over `driver` with both caches disabled.
///
/// Tests that modify memory through the mock directly must not observe
/// stale cached pages.
pub fn make_vmi<Arch>(driver: MockDriver<Arch>) -> Result<VmiCore<MockDriver<Arch>>, VmiError>
where
    Arch: Architecture,
{
    Ok(VmiCore::new(driver)?.without_cache())
}

////////////////////////////////////////////////////////////////////////////////
// Process inspector
////////////////////////////////////////////////////////////////////////////////

enum MockProcess {
    Present(ActiveProcess),
    Fault(PageFault),
}

/// A process inspector backed by a shared table.
///
/// Clones share the table, so a test can keep a handle and add processes
/// after the inspector has been handed to a registry.
#[derive(Clone, Default)]
pub struct MockProcessInspector {
    processes: Rc<RefCell<IndexMap<ProcessObject, MockProcess>>>,
}

impl MockProcessInspector {
    /// Creates an empty inspector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a process.
    pub fn insert(&self, object: ProcessObject, id: ProcessId, name: &str) {
        let process = ActiveProcess {
            object,
            id,
            parent_id: ProcessId(0),
            name: name.to_owned(),
            translation_root: Pa(0),
            regions: Vec::new(),
        };

        self.processes
            .borrow_mut()
            .insert(object, MockProcess::Present(process));
    }

    /// Adds a process whose structures cannot be read.
    pub fn insert_fault(&self, object: ProcessObject, pf: impl Into<PageFault>) {
        self.processes
            .borrow_mut()
            .insert(object, MockProcess::Fault(pf.into()));
    }
}

impl<Driver> ProcessInspector<Driver> for MockProcessInspector
where
    Driver: VmiDriver,
{
    fn processes(&self, _vmi: &VmiCore<Driver>) -> Result<Vec<ProcessObject>, VmiError> {
        Ok(self.processes.borrow().keys().copied().collect())
    }

    fn inspect(
        &self,
        _vmi: &VmiCore<Driver>,
        object: ProcessObject,
    ) -> Result<ActiveProcess, VmiError> {
        match self.processes.borrow().get(&object) {
            Some(MockProcess::Present(process)) => Ok(process.clone()),
            Some(MockProcess::Fault(pf)) => Err(VmiError::page_fault(*pf)),
            None => Err(VmiError::Other("unknown process object")),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Plugin notifier
////////////////////////////////////////////////////////////////////////////////

/// A notification received by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A plugin was initialized.
    Initialized {
        /// Plugin name.
        name: String,

        /// Plugin arguments.
        arguments: Vec<String>,
    },

    /// A process terminated.
    ProcessTermination(ActiveProcess),

    /// The monitor shut down.
    Shutdown,
}

/// A plugin notifier that records every notification.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notifications: Rc<RefCell<Vec<Notification>>>,
    fail_termination: Rc<Cell<bool>>,
}

impl RecordingNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent termination notification fail.
    pub fn fail_termination(&self) {
        self.fail_termination.set(true);
    }

    /// Returns the notifications received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }
}

impl PluginNotifier for RecordingNotifier {
    fn initialize_plugin(&mut self, name: &str, arguments: &[String]) -> Result<(), VmiError> {
        self.notifications.borrow_mut().push(Notification::Initialized {
            name: name.to_owned(),
            arguments: arguments.to_vec(),
        });
        Ok(())
    }

    fn on_process_termination(&mut self, process: &ActiveProcess) -> Result<(), VmiError> {
        if self.fail_termination.get() {
            return Err(VmiError::Other("plugin failed"));
        }

        self.notifications
            .borrow_mut()
            .push(Notification::ProcessTermination(process.clone()));
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<(), VmiError> {
        self.notifications.borrow_mut().push(Notification::Shutdown);
        Ok(())
    }
}
