//! AArch64 architecture definitions.
//!
//! Only the 4 KiB translation granule with 48-bit virtual addresses is
//! supported, which is what Linux kernels use by default.

mod event;
mod paging;
mod registers;

use vmi_core::{
    AccessContext, AddressContext, Architecture, EventReason as _, Gfn, Pa, Va, VmiCore,
    VmiDriver, VmiError, VmiEvent,
};

pub use self::{
    event::{EventInterrupt, EventReason},
    paging::{PageTableEntry, PageTableLevel},
    registers::Registers,
};

/// AArch64 architecture.
#[derive(Debug)]
pub struct Aarch64;

impl Architecture for Aarch64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    /// `BRK #0`
    const BREAKPOINT: &'static [u8] = &[0x00, 0x00, 0x20, 0xd4];

    const NAME: &'static str = "aarch64";

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
        Self::va_offset_for(va, PageTableLevel::L3)
    }

    fn translate_address<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut table = Pa(root.0 & Self::PAGE_MASK);
        let mut level = PageTableLevel::L0;

        loop {
            let entry_address = table + Self::va_index_for(va, level) * 8;
            let entry = vmi.read_struct::<PageTableEntry>(AccessContext::direct(entry_address))?;

            if !entry.valid() {
                return Err(VmiError::page_fault((va, root)));
            }

            if level == PageTableLevel::L3 {
                // Bit 1 clear is a reserved encoding at level 3.
                if !entry.table_or_page() {
                    return Err(VmiError::page_fault((va, root)));
                }

                return Ok(Self::pa_from_gfn(entry.pfn()) + Self::va_offset(va));
            }

            if !entry.table_or_page() {
                if !level.allows_block() {
                    return Err(VmiError::page_fault((va, root)));
                }

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
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Self>,
    ) -> Result<Option<Pa>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        if event.reason().as_software_breakpoint().is_none() {
            return Ok(None);
        }

        let registers = event.registers();
        let root = Pa(registers.ttbr1_el1 & 0x0000_ffff_ffff_f000);
        let pa = vmi.translate_address(AddressContext::new(Va(registers.pc), root))?;
        Ok(Some(pa))
    }
}

impl Aarch64 {
    fn va_offset_mask(level: PageTableLevel) -> u64 {
        (1 << level.shift()) - 1
    }

    /// Calculates the offset within a page or block mapped at the given
    /// level.
    pub fn va_offset_for(va: Va, level: PageTableLevel) -> u64 {
        va.0 & Self::va_offset_mask(level)
    }

    /// Calculates the index into the translation table at the given level.
    pub fn va_index_for(va: Va, level: PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }
}
