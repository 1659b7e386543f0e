//! Device telemetry records and NVML sampling
//!
//! Reporting tools consume these as plain data records; the scheduler itself
//! never looks at them. Sampling degrades gracefully when the vendor library
//! is absent, mirroring how GPU detection behaves on machines without a GPU.

use chrono::{DateTime, Utc};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::XpusliceResult;

/// Point-in-time utilization sample for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSample {
    /// Device identifier from configuration
    pub device_id: String,
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Compute utilization percentage (0-100), if the device reports it
    pub utilization_percent: Option<u32>,
    /// Device memory in use, bytes
    pub memory_used: u64,
    /// Total device memory, bytes
    pub memory_total: u64,
    /// Per-process memory breakdown
    pub processes: Vec<ProcessSample>,
}

/// Memory attributed to one process on the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    /// Bytes of device memory held; zero when the driver withholds the figure
    pub memory_used: u64,
}

/// NVML-backed telemetry source for one device
pub struct NvmlSampler {
    nvml: Nvml,
    index: u32,
    device_id: String,
}

impl NvmlSampler {
    /// Connect to NVML and bind to the device at `index`.
    ///
    /// Fails when the vendor library is not present; callers are expected to
    /// run without telemetry in that case.
    pub fn new(index: u32, device_id: impl Into<String>) -> XpusliceResult<Self> {
        let nvml = Nvml::init()?;
        let device_id = device_id.into();
        debug!(index, device = %device_id, "NVML sampler attached");
        Ok(Self {
            nvml,
            index,
            device_id,
        })
    }

    /// Take one utilization/memory sample.
    pub fn sample(&self) -> XpusliceResult<DeviceSample> {
        let device = self.nvml.device_by_index(self.index)?;
        let memory = device.memory_info()?;
        let utilization = device.utilization_rates().ok().map(|u| u.gpu);
        let processes = device
            .running_compute_processes()
            .unwrap_or_default()
            .into_iter()
            .map(|p| ProcessSample {
                pid: p.pid,
                memory_used: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();

        Ok(DeviceSample {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            utilization_percent: utilization,
            memory_used: memory.used,
            memory_total: memory.total,
            processes,
        })
    }

    /// Device memory currently in use, for the memory quota check.
    pub fn memory_used(&self) -> XpusliceResult<u64> {
        let device = self.nvml.device_by_index(self.index)?;
        Ok(device.memory_info()?.used)
    }
}
