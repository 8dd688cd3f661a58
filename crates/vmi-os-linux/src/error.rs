use vmi_core::VmiError;

/// Error types for Linux operations.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// A kernel symbol required for a hook could not be resolved.
    #[error("Kernel symbol `{symbol}` not found")]
    SymbolNotFound {
        /// Name of the symbol.
        symbol: &'static str,

        /// The error reported by the driver.
        #[source]
        source: Box<VmiError>,
    },

    /// A hook received a null `task_struct` pointer.
    #[error("`{hook}` called with a null task_struct")]
    NullTaskStruct {
        /// Name of the hooked kernel function.
        hook: &'static str,
    },
}

impl From<LinuxError> for VmiError {
    fn from(value: LinuxError) -> Self {
        VmiError::Os(value.into())
    }
}
