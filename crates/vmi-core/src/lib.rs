//! Core VMI functionality.
//!
//! This crate defines the vocabulary shared by every other part of the
//! monitor: guest addresses, the [`VmiDriver`] abstraction over the
//! introspection driver, the [`Architecture`] profile, the cached
//! [`VmiCore`] memory accessor, and the OS-level process registry.

pub mod arch;
mod cache;
mod core;
mod driver;
mod error;
mod event;
pub mod os;
mod page;
mod plugin;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::{num::NonZeroUsize, time::Duration};

use zerocopy::{FromBytes, IntoBytes};

use self::cache::GuestCache;
pub use self::{
    arch::{Architecture, EventInterrupt, EventReason, Registers},
    core::{
        AccessContext, AddressContext, Gfn, Hex, MemoryAccess, Pa, TranslationMechanism, Va,
        VcpuId, VmiInfo,
    },
    driver::VmiDriver,
    error::{PageFault, PageFaults, VmiError},
    event::{EventMonitor, VmiEvent, VmiEventResponse, VmiEventResponseFlags},
    page::VmiMappedPage,
    plugin::PluginNotifier,
};

/// Guest memory access on top of a [`VmiDriver`].
///
/// Page reads and virtual-to-physical translations are cached. Both caches
/// must be flushed whenever guest memory is modified behind their back,
/// which is what the breakpoint machinery does after every write of a
/// breakpoint or an original instruction.
pub struct VmiCore<Driver>
where
    Driver: VmiDriver,
{
    driver: Driver,
    cache: Option<GuestCache>,
}

impl<Driver> VmiCore<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new `VmiCore` with caches of 8192 entries each.
    pub fn new(driver: Driver) -> Result<Self, VmiError> {
        Ok(Self {
            driver,
            cache: Some(GuestCache::new(GuestCache::DEFAULT_CAPACITY)),
        })
    }

    /// Replaces the caches with ones of the given capacity.
    pub fn with_cache_capacity(self, capacity: NonZeroUsize) -> Self {
        Self {
            cache: Some(GuestCache::new(capacity)),
            ..self
        }
    }

    /// Disables both caches.
    ///
    /// Every read and every translation goes to the driver afterwards.
    pub fn without_cache(self) -> Self {
        Self {
            cache: None,
            ..self
        }
    }

    /// Clears both caches.
    pub fn flush_caches(&self) {
        if let Some(cache) = &self.cache {
            cache.flush();
        }
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the virtual machine.
    pub fn info(&self) -> Result<VmiInfo, VmiError> {
        self.driver.info()
    }

    /// Returns the operating system family running in the guest.
    pub fn os_type(&self) -> Result<os::OsType, VmiError> {
        self.driver.os_type()
    }

    /// Pauses the virtual machine.
    pub fn pause(&self) -> Result<(), VmiError> {
        self.driver.pause()
    }

    /// Resumes the virtual machine.
    pub fn resume(&self) -> Result<(), VmiError> {
        self.driver.resume()
    }

    /// Pauses the virtual machine until the returned guard is dropped.
    pub fn pause_guard(&self) -> Result<VmiPauseGuard<'_, Driver>, VmiError> {
        VmiPauseGuard::new(&self.driver)
    }

    /// Retrieves the memory access permissions of a guest frame.
    pub fn memory_access(&self, gfn: Gfn) -> Result<MemoryAccess, VmiError> {
        self.driver.memory_access(gfn)
    }

    /// Sets the memory access permissions of a guest frame.
    pub fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.driver.set_memory_access(gfn, access)
    }

    /// Translates a kernel symbol to its virtual address.
    pub fn kernel_symbol(&self, name: &str) -> Result<Va, VmiError> {
        self.driver.kernel_symbol(name)
    }

    /// Returns the root of the address space of the process with the given
    /// ID.
    pub fn translation_root(&self, pid: os::ProcessId) -> Result<Pa, VmiError> {
        self.driver.translation_root(pid)
    }

    /// Enables delivery of the given kind of events.
    pub fn monitor_enable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.driver.monitor_enable(option)
    }

    /// Disables delivery of the given kind of events.
    pub fn monitor_disable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.driver.monitor_disable(option)
    }

    /// Returns the number of events the driver has queued but not yet
    /// delivered.
    pub fn events_pending(&self) -> usize {
        self.driver.events_pending()
    }

    /// Blocks until the driver delivers an event or `timeout` elapses.
    ///
    /// `handler` runs synchronously, from inside this call, for every
    /// delivered event.
    pub fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Driver::Architecture>) -> VmiEventResponse,
    ) -> Result<(), VmiError> {
        self.driver.wait_for_event(timeout, handler)
    }

    /// Reads guest memory.
    ///
    /// Reads crossing a page boundary translate every page separately.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut done = 0;

        while done < buffer.len() {
            let pa = self.translate_access_context(ctx + done as u64)?;
            let offset = Driver::Architecture::pa_offset(pa) as usize;

            let page = self.read_page(Driver::Architecture::gfn_from_pa(pa))?;
            let available = page.get(offset..).ok_or(VmiError::OutOfBounds)?;

            let chunk = available.len().min(buffer.len() - done);
            buffer[done..done + chunk].copy_from_slice(&available[..chunk]);
            done += chunk;
        }

        Ok(())
    }

    /// Writes guest memory.
    ///
    /// The caches are left untouched; callers that read the written range
    /// back must flush them first.
    pub fn write(&self, ctx: impl Into<AccessContext>, buffer: &[u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut done = 0;

        while done < buffer.len() {
            let pa = self.translate_access_context(ctx + done as u64)?;
            let offset = Driver::Architecture::pa_offset(pa);

            let room = (Driver::Architecture::PAGE_SIZE - offset) as usize;
            let chunk = room.min(buffer.len() - done);

            self.driver.write_page(
                Driver::Architecture::gfn_from_pa(pa),
                offset,
                &buffer[done..done + chunk],
            )?;
            done += chunk;
        }

        Ok(())
    }

    /// Reads a little-endian 64-bit value.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, VmiError> {
        let mut buffer = [0u8; 8];
        self.read(ctx, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a plain-old-data structure.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, VmiError>
    where
        T: IntoBytes + FromBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address(&self, ctx: impl Into<AddressContext>) -> Result<Pa, VmiError> {
        self.translate_access_context(AccessContext::from(ctx.into()))
    }

    /// Translates an access context to a physical address.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, VmiError> {
        let root = match ctx.mechanism {
            TranslationMechanism::Direct => return Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root } => root,
        };

        let walk =
            || Driver::Architecture::translate_address(self, Va(ctx.address), root);

        match &self.cache {
            Some(cache) => cache.translation(ctx, walk),
            None => walk(),
        }
    }

    /// Reads a page of guest memory.
    pub fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        match &self.cache {
            Some(cache) => cache.page(gfn, || self.driver.read_page(gfn)),
            None => self.driver.read_page(gfn),
        }
    }
}

/// Keeps the virtual machine paused while alive.
pub struct VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    driver: &'a Driver,
}

impl<'a, Driver> VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Pauses the virtual machine.
    pub fn new(driver: &'a Driver) -> Result<Self, VmiError> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<Driver> Drop for VmiPauseGuard<'_, Driver>
where
    Driver: VmiDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(%err, "failed to resume the virtual machine");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        os::OsType,
        testing::{MockDriver, TestArch},
    };

    #[test]
    fn stale_page_until_flushed() -> Result<(), VmiError> {
        let driver = MockDriver::<TestArch>::new(OsType::Linux);
        driver.write_memory(Pa(0x1000), &[0x55]);

        let vmi = VmiCore::new(driver)?;
        assert_eq!(vmi.read_u64(Pa(0x1000))? & 0xff, 0x55);

        vmi.driver().write_memory(Pa(0x1000), &[0xcc]);
        assert_eq!(vmi.read_u64(Pa(0x1000))? & 0xff, 0x55);

        vmi.flush_caches();
        assert_eq!(vmi.read_u64(Pa(0x1000))? & 0xff, 0xcc);
        Ok(())
    }

    #[test]
    fn read_crosses_pages() -> Result<(), VmiError> {
        let driver = MockDriver::<TestArch>::new(OsType::Linux);
        driver.write_memory(Pa(0x1ffc), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let vmi = VmiCore::new(driver)?.without_cache();
        assert_eq!(vmi.read_u64(Pa(0x1ffc))?, 0x0807_0605_0403_0201);
        Ok(())
    }

    #[test]
    fn pause_guard_resumes() -> Result<(), VmiError> {
        let vmi = VmiCore::new(MockDriver::<TestArch>::new(OsType::Linux))?;

        {
            let _pause_guard = vmi.pause_guard()?;
            assert_eq!(vmi.driver().pause_count(), 1);
            assert_eq!(vmi.driver().resume_count(), 0);
        }

        assert_eq!(vmi.driver().resume_count(), 1);
        Ok(())
    }
}
