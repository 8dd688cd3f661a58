//! VMI utilities

#[cfg(feature = "interrupt")]
pub mod interrupt;

pub mod singlestep;
