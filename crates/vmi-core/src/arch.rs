//! Architecture profiles.
//!
//! An [`Architecture`] supplies everything the breakpoint machinery needs
//! to know about a CPU family: the page geometry, the breakpoint encoding,
//! the page-table walk and the decoding of a trap into the guest physical
//! address of the breakpoint that raised it.

use std::fmt::Debug;

use crate::{Gfn, Pa, Va, VmiCore, VmiDriver, VmiError, VmiEvent};

/// CPU architecture-specific operations and constants.
pub trait Architecture {
    /// The size of a memory page in bytes.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0x1000`
    /// - **AArch64**: `0x1000` (4 KiB granule)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// physical addresses.
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    const PAGE_MASK: u64;

    /// The machine code of the software breakpoint instruction.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `&[0xcc]` (`INT3`)
    /// - **AArch64**: `&[0x00, 0x00, 0x20, 0xd4]` (`BRK #0`)
    const BREAKPOINT: &'static [u8];

    /// Human readable name of the architecture.
    const NAME: &'static str;

    /// The complete set of CPU registers for the architecture.
    type Registers: Registers;

    /// The levels of the architecture's paging structure.
    type PageTableLevel: Debug + Clone + Copy;

    /// Architecture-specific event details.
    type EventReason: EventReason;

    /// Converts a guest physical address to a guest frame number.
    fn gfn_from_pa(pa: Pa) -> Gfn;

    /// Converts a guest frame number to a guest physical address.
    fn pa_from_gfn(gfn: Gfn) -> Pa;

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64;

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64;

    /// Performs a full page table walk to translate a virtual address to a
    /// physical address.
    fn translate_address<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;

    /// Decodes the guest physical address of the breakpoint that raised
    /// `event`.
    ///
    /// Returns `None` if the event is not a software breakpoint.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `(gfn << 12) + (rip & 0xfff)`
    /// - **AArch64**: page table walk of `PC` through `TTBR1_EL1`
    fn trap_address<Driver>(
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Self>,
    ) -> Result<Option<Pa>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;
}

/// Complete set of CPU registers for a specific architecture.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// Returns the current value of the instruction pointer.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `RIP`
    /// - **AArch64**: `PC`
    fn instruction_pointer(&self) -> u64;

    /// Returns the physical address of the root of the page table
    /// hierarchy that translates `va`.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `CR3 & 0x0000FFFFFFFFF000`
    /// - **AArch64**: `TTBR1_EL1` for the upper half, `TTBR0_EL1` otherwise
    fn translation_root(&self, va: Va) -> Pa;
}

/// A software breakpoint event.
pub trait EventInterrupt
where
    Self: Debug + Clone + Copy,
{
    /// Returns the guest frame number of the trapping instruction.
    fn gfn(&self) -> Gfn;

    /// Returns the length of the trapping instruction.
    fn instruction_length(&self) -> u8;
}

/// The reason for an event, allowing for type-safe access to specific event
/// details.
pub trait EventReason
where
    Self: Debug + Clone + Copy,
{
    /// If the event was caused by a software breakpoint, returns the details
    /// of that breakpoint.
    fn as_software_breakpoint(&self) -> Option<&impl EventInterrupt>;

    /// Returns `true` if the event reports a completed single-step.
    fn is_singlestep(&self) -> bool;
}
