use serde::{Deserialize, Serialize};

use crate::Gfn;

/// Dimensions of the introspected virtual machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VmiInfo {
    /// Highest guest frame number backed by memory.
    pub max_gfn: Gfn,

    /// Number of virtual CPUs.
    pub vcpus: u16,
}
