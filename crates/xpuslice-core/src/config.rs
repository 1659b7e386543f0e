//! Configuration types for xpuslice
//!
//! The core never discovers its own identity: the slot index, quota share
//! and device binding are handed down by the deployment (device plugin,
//! container runtime) through this configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{XpusliceError, XpusliceResult};

/// Per-process limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// This process's slot in the shared segment
    pub slot_index: u32,
    /// Quota share as an integer percentage of the rotation budget (1-100)
    pub quota_percent: u32,
    /// Device binding
    pub device: DeviceConfig,
    /// Shared segment location
    pub segment: SegmentConfig,
    /// Timing knobs
    pub timing: TimingConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            slot_index: 0,
            quota_percent: 100,
            device: DeviceConfig::default(),
            segment: SegmentConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl LimiterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> XpusliceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            XpusliceError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed configuration up front; the limiter treats this as fatal.
    pub fn validate(&self) -> XpusliceResult<()> {
        if self.quota_percent == 0 || self.quota_percent > 100 {
            return Err(XpusliceError::Config(format!(
                "quota_percent must be within 1-100, got {}",
                self.quota_percent
            )));
        }
        if self.device.device_id.is_empty() {
            return Err(XpusliceError::Config("device_id must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Device binding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier as reported by the deployment
    pub device_id: String,
    /// Device index for telemetry queries
    pub device_index: u32,
    /// Enable the device memory quota check
    pub limit_memory: bool,
    /// Device memory quota in bytes
    pub memory_quota_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "xpu-0".to_string(),
            device_index: 0,
            limit_memory: false,
            memory_quota_bytes: 0,
        }
    }
}

/// Shared segment location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Well-known path all tenants of one device map
    pub path: PathBuf,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/shm/xpuslice.ctx"),
        }
    }
}

/// Timing knobs for the scheduler
///
/// Defaults reproduce the production values; tests shrink them to run
/// fail-over scenarios without real delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Base scheduling time unit in milliseconds
    pub time_unit_ms: u64,
    /// Heartbeat age past which a node is presumed dead
    pub stale_timeout_ms: u64,
    /// Heartbeat age bound for voluntary hand-off candidates
    pub handoff_liveness_ms: u64,
    /// Background reconciliation loop period
    pub poll_period_ms: u64,
    /// Admission tokens released per slice-loop pass
    pub op_batch: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            time_unit_ms: 1,
            stale_timeout_ms: 1_000,
            handoff_liveness_ms: 2_000,
            // empirical value: 1/6 s
            poll_period_ms: 167,
            op_batch: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LimiterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota_percent, 100);
        assert_eq!(config.timing.poll_period_ms, 167);
    }

    #[test]
    fn test_quota_bounds_rejected() {
        let mut config = LimiterConfig::default();
        config.quota_percent = 0;
        assert!(config.validate().is_err());
        config.quota_percent = 101;
        assert!(config.validate().is_err());
        config.quota_percent = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let mut config = LimiterConfig::default();
        config.device.device_id.clear();
        assert!(matches!(config.validate(), Err(XpusliceError::Config(_))));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            slot_index = 3
            quota_percent = 30

            [device]
            device_id = "npu-1"
            device_index = 1
        "#;
        let config: LimiterConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.slot_index, 3);
        assert_eq!(config.quota_percent, 30);
        assert_eq!(config.device.device_id, "npu-1");
        // untouched sections fall back to defaults
        assert_eq!(config.timing.time_unit_ms, 1);
        assert_eq!(config.segment.path, PathBuf::from("/dev/shm/xpuslice.ctx"));
    }
}
