use serde::{Deserialize, Serialize};

use crate::{MemoryAccess, Va};

/// A memory region of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Start address of the region.
    pub base: Va,

    /// Size of the region in bytes.
    pub size: u64,

    /// Name of the module mapped into the region, if any.
    pub module_name: String,

    /// Protection of the region.
    pub protection: MemoryAccess,

    /// The region is shared with other processes.
    pub is_shared_memory: bool,

    /// The region is being unmapped.
    pub is_being_deleted: bool,

    /// The region holds the main executable image of the process.
    pub is_process_base_image: bool,
}

impl MemoryRegion {
    /// Returns the first address past the end of the region.
    pub fn end(&self) -> Va {
        self.base + self.size
    }

    /// Checks whether `address` lies within the region.
    pub fn contains(&self, address: Va) -> bool {
        self.base <= address && address < self.end()
    }
}
