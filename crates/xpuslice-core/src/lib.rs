//! xpuslice-core: Core types for the xpuslice accelerator limiter
//!
//! This crate provides the fundamental types used throughout xpuslice:
//! - Per-process limiter configuration
//! - Error handling
//! - The injectable clock shared by scheduler and segment code
//! - Device telemetry records and NVML sampling

pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use telemetry::*;
