//! AMD64 architecture definitions.

mod event;
mod paging;
mod registers;

use vmi_core::{
    AccessContext, Architecture, EventInterrupt as _, EventReason as _, Gfn, Pa, Registers as _,
    Va, VmiCore, VmiDriver, VmiError, VmiEvent,
};

pub use self::{
    event::{EventInterrupt, EventReason, EventSinglestep},
    paging::{PageTableEntry, PageTableLevel},
    registers::{RFLAGS_TF, Registers},
};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    const BREAKPOINT: &'static [u8] = &[0xcc];

    const NAME: &'static str = "amd64";

    type Registers = Registers;
    type PageTableLevel = PageTableLevel;
    type EventReason = EventReason;

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
        Self::va_offset_for(va, PageTableLevel::Pt)
    }

    fn translate_address<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut table = Pa(root.0 & Self::PAGE_MASK);
        let mut level = PageTableLevel::Pml4;

        loop {
            let entry_address = table + Self::va_index_for(va, level) * 8;
            let entry = vmi.read_struct::<PageTableEntry>(AccessContext::direct(entry_address))?;

            if !entry.present() {
                return Err(VmiError::page_fault((va, root)));
            }

            // PML4 entries cannot map pages directly.
            let maps_page = level == PageTableLevel::Pt
                || (level != PageTableLevel::Pml4 && entry.large());

            if maps_page {
                let base = Self::pa_from_gfn(entry.pfn());
                let base = Pa(base.0 & !Self::va_offset_mask(level));
                return Ok(base + Self::va_offset_for(va, level));
            }

            table = Self::pa_from_gfn(entry.pfn());
            level = match level.next() {
                Some(next) => next,
                None => return Err(VmiError::page_fault((va, root))),
            };
        }
    }

    fn trap_address<Driver>(
        _vmi: &VmiCore<Driver>,
        event: &VmiEvent<Self>,
    ) -> Result<Option<Pa>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let interrupt = match event.reason().as_software_breakpoint() {
            Some(interrupt) => interrupt,
            None => return Ok(None),
        };

        let ip = Va(event.registers().instruction_pointer());
        Ok(Some(Self::pa_from_gfn(interrupt.gfn()) + Self::va_offset(ip)))
    }
}

impl Amd64 {
    fn va_offset_mask(level: PageTableLevel) -> u64 {
        (1 << level.shift()) - 1
    }

    /// Calculates the offset within a page mapped at the given level.
    pub fn va_offset_for(va: Va, level: PageTableLevel) -> u64 {
        va.0 & Self::va_offset_mask(level)
    }

    /// Calculates the index into the page table at the given level.
    pub fn va_index_for(va: Va, level: PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }
}

#[cfg(test)]
mod tests {
    use vmi_core::{
        AddressContext, VcpuId,
        os::OsType,
        testing::MockDriver,
    };

    use super::*;

    // Builds PML4 -> PDPT -> PD -> PT for `va`, mapping it to `target`.
    fn map_4k(driver: &MockDriver<Amd64>, root: Pa, va: Va, target: Pa) {
        let tables = [root, Pa(0x3000), Pa(0x4000), Pa(0x5000)];
        let levels = [
            PageTableLevel::Pml4,
            PageTableLevel::Pdpt,
            PageTableLevel::Pd,
            PageTableLevel::Pt,
        ];

        for (index, level) in levels.into_iter().enumerate() {
            let next = match tables.get(index + 1) {
                Some(table) => *table,
                None => Pa(target.0 & Amd64::PAGE_MASK),
            };

            let entry = next.0 | 0b11;
            let address = tables[index] + Amd64::va_index_for(va, level) * 8;
            driver.write_memory(address, &entry.to_le_bytes());
        }
    }

    #[test]
    fn translate_4k_page() -> Result<(), VmiError> {
        let driver = MockDriver::<Amd64>::new(OsType::Linux);
        let va = Va(0xffff_ffff_8100_0123);
        map_4k(&driver, Pa(0x2000), va, Pa(0x7000));

        let vmi = VmiCore::new(driver)?;
        let pa = vmi.translate_address(AddressContext::new(va, Pa(0x2000)))?;
        assert_eq!(pa, Pa(0x7123));
        Ok(())
    }

    #[test]
    fn translate_2m_page() -> Result<(), VmiError> {
        let driver = MockDriver::<Amd64>::new(OsType::Linux);
        let va = Va(0xffff_ffff_8112_3456);
        let root = Pa(0x2000);

        let pdpt = Pa(0x3000);
        let pd = Pa(0x4000);
        let pml4e = pdpt.0 | 0b11;
        let pdpte = pd.0 | 0b11;
        let pde = 0x0040_0000u64 | (1 << 7) | 0b11;

        let entry = |table: Pa, level| table + Amd64::va_index_for(va, level) * 8;
        driver.write_memory(entry(root, PageTableLevel::Pml4), &pml4e.to_le_bytes());
        driver.write_memory(entry(pdpt, PageTableLevel::Pdpt), &pdpte.to_le_bytes());
        driver.write_memory(entry(pd, PageTableLevel::Pd), &pde.to_le_bytes());

        let vmi = VmiCore::new(driver)?;
        let pa = vmi.translate_address(AddressContext::new(va, root))?;
        assert_eq!(pa, Pa(0x0040_0000 + 0x12_3456));
        Ok(())
    }

    #[test]
    fn translate_not_present() -> Result<(), VmiError> {
        let driver = MockDriver::<Amd64>::new(OsType::Linux);
        driver.write_memory(Pa(0x2000), &[0u8; 8]);

        let vmi = VmiCore::new(driver)?;
        let result = vmi.translate_address(AddressContext::new(Va(0x1000), Pa(0x2000)));
        assert!(matches!(result, Err(VmiError::PageFault(_))));
        Ok(())
    }

    #[test]
    fn trap_address_from_gfn_and_rip() -> Result<(), VmiError> {
        let vmi = VmiCore::new(MockDriver::<Amd64>::new(OsType::Linux))?;

        let registers = Registers {
            rip: 0xffff_ffff_8100_0abc,
            ..Default::default()
        };
        let reason = EventReason::Breakpoint(EventInterrupt {
            gfn: Gfn(0x1234),
            instruction_length: 1,
        });

        let event = VmiEvent::new(VcpuId(0), registers, reason);
        assert_eq!(Amd64::trap_address(&vmi, &event)?, Some(Pa(0x1234abc)));

        let event = VmiEvent::<Amd64>::new(
            VcpuId(0),
            registers,
            EventReason::Singlestep(EventSinglestep { gfn: Gfn(0x1234) }),
        );
        assert_eq!(Amd64::trap_address(&vmi, &event)?, None);
        Ok(())
    }
}
