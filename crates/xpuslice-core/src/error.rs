//! Error types for xpuslice

use thiserror::Error;

/// Main error type for xpuslice
#[derive(Error, Debug)]
pub enum XpusliceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Slot index outside the fixed tenant bound
    #[error("Slot index {idx} out of range (bound {bound})")]
    SlotOutOfRange { idx: u32, bound: u32 },

    /// Shared segment error
    #[error("Shared segment error: {0}")]
    Segment(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Device query error
    #[error("Device error: {0}")]
    Device(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for xpuslice operations
pub type XpusliceResult<T> = Result<T, XpusliceError>;

impl From<toml::de::Error> for XpusliceError {
    fn from(err: toml::de::Error) -> Self {
        XpusliceError::Config(err.to_string())
    }
}

impl From<nvml_wrapper::error::NvmlError> for XpusliceError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        XpusliceError::Device(err.to_string())
    }
}
