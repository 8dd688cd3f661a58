mod address;
mod address_context;
mod hex;
mod info;
pub(crate) mod macros;
mod memory_access;
mod vcpu_id;

pub use self::{
    address::{Gfn, Pa, Va},
    address_context::{AccessContext, AddressContext, TranslationMechanism},
    hex::Hex,
    info::VmiInfo,
    memory_access::MemoryAccess,
    vcpu_id::VcpuId,
};
