use vmi_core::VmiError;

/// Error types for Windows operations.
#[derive(thiserror::Error, Debug)]
pub enum WindowsError {
    /// A kernel symbol required for a hook could not be resolved.
    #[error("Kernel symbol `{symbol}` not found")]
    SymbolNotFound {
        /// Name of the symbol.
        symbol: &'static str,

        /// The error reported by the driver.
        #[source]
        source: Box<VmiError>,
    },

    /// A hook received a null `EPROCESS` pointer.
    #[error("`{hook}` called with a null EPROCESS")]
    NullProcess {
        /// Name of the hooked kernel function.
        hook: &'static str,
    },

    /// The guest kernel is about to crash.
    #[error("Guest bug check 0x{code:08x}")]
    BugCheck {
        /// The bug check code.
        code: u32,
    },

    /// A VAD protection value out of range.
    #[error("Invalid protection value {0}")]
    InvalidProtection(u32),
}

impl From<WindowsError> for VmiError {
    fn from(value: WindowsError) -> Self {
        VmiError::Os(value.into())
    }
}
