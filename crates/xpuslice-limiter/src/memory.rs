//! Device memory quota check
//!
//! Downward collaborator of the admission gate: callers consult
//! [`MemoryLimiter::memory_check`] before allocating device memory. The
//! scheduler never calls this itself.

use tracing::warn;
use xpuslice_core::{DeviceConfig, NvmlSampler, XpusliceResult};

/// Source of the device's current memory usage.
pub trait MemoryProbe: Send + Sync {
    fn memory_used(&self) -> XpusliceResult<u64>;
}

impl MemoryProbe for NvmlSampler {
    fn memory_used(&self) -> XpusliceResult<u64> {
        NvmlSampler::memory_used(self)
    }
}

/// Boolean admission check against the configured device memory quota.
pub struct MemoryLimiter {
    probe: Box<dyn MemoryProbe>,
    limit_memory: bool,
    quota_bytes: u64,
}

impl MemoryLimiter {
    pub fn new(config: &DeviceConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            limit_memory: config.limit_memory,
            quota_bytes: config.memory_quota_bytes,
        }
    }

    /// True iff an allocation of `requested` bytes stays within the quota.
    /// A failed usage query denies the allocation rather than overcommit.
    pub fn memory_check(&self, requested: u64) -> bool {
        if !self.limit_memory {
            return true;
        }
        let used = match self.probe.memory_used() {
            Ok(used) => used,
            Err(e) => {
                warn!(error = %e, "device memory query failed, denying allocation");
                return false;
            }
        };
        if requested.saturating_add(used) > self.quota_bytes {
            warn!(
                requested,
                used,
                quota = self.quota_bytes,
                "allocation exceeds device memory quota"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpuslice_core::XpusliceError;

    struct FixedProbe(XpusliceResult<u64>);

    impl MemoryProbe for FixedProbe {
        fn memory_used(&self) -> XpusliceResult<u64> {
            match &self.0 {
                Ok(used) => Ok(*used),
                Err(_) => Err(XpusliceError::Device("probe offline".to_string())),
            }
        }
    }

    fn config(limit_memory: bool, quota_bytes: u64) -> DeviceConfig {
        DeviceConfig {
            limit_memory,
            memory_quota_bytes: quota_bytes,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_unlimited_always_passes() {
        let limiter = MemoryLimiter::new(&config(false, 0), Box::new(FixedProbe(Ok(u64::MAX))));
        assert!(limiter.memory_check(u64::MAX));
    }

    #[test]
    fn test_within_quota_passes() {
        let limiter = MemoryLimiter::new(&config(true, 1_000), Box::new(FixedProbe(Ok(400))));
        assert!(limiter.memory_check(600));
        assert!(!limiter.memory_check(601));
    }

    #[test]
    fn test_probe_failure_denies() {
        let limiter = MemoryLimiter::new(
            &config(true, 1_000),
            Box::new(FixedProbe(Err(XpusliceError::Device(String::new())))),
        );
        assert!(!limiter.memory_check(1));
    }
}
