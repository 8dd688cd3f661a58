use serde::{Deserialize, Serialize};

use super::{Pa, Va};

/// A virtual address together with the page-table root it is translated
/// through.
///
/// Kernel notification points are resolved to a virtual address first and
/// then translated through the root of the kernel address space (e.g.
/// `CR3` of the idle/system process on AMD64, `TTBR1_EL1` on AArch64).
///
/// # Example
///
/// ```
/// # use vmi_core::{AddressContext, Pa, Va};
/// let ctx = AddressContext::new(Va(0xffffffff81000000), Pa(0x1aa000));
/// assert_eq!((ctx + 0x10).va, Va(0xffffffff81000010));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The translation root, the base of the page table hierarchy.
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext`.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from((va, root): (Va, Pa)) -> Self {
        Self { va, root }
    }
}

impl std::ops::Add<u64> for AddressContext {
    type Output = AddressContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            va: self.va + rhs,
            ..self
        }
    }
}

impl std::fmt::Display for AddressContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} @ {}", self.va, self.root)
    }
}

/// The mechanism used for translating an address before it is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// The address is a guest physical address.
    Direct,

    /// The address is a virtual address translated through the given root.
    Paging {
        /// Root of the paging structure.
        root: Pa,
    },
}

/// Describes how a memory access resolves to guest physical memory.
///
/// Breakpoints are written through [`Direct`] contexts, while kernel
/// symbols are resolved through [`Paging`] contexts.
///
/// [`Direct`]: TranslationMechanism::Direct
/// [`Paging`]: TranslationMechanism::Paging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access, physical or virtual depending on
    /// [`mechanism`](Self::mechanism).
    pub address: u64,

    /// The mechanism used for address translation.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates an access context for a guest physical address.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates an access context for a virtual address translated through
    /// `root`.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: root.into() },
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::paging(value.va, value.root)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from((va, root): (Va, Pa)) -> Self {
        Self::paging(va, root)
    }
}

impl std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address + rhs,
            ..self
        }
    }
}
