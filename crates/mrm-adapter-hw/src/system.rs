//! Host-memory sampler backed by the operating system

use crate::profile::HardwareProfile;
use crate::profiler::HardwareSampler;
use crate::{bytes_to_gb, Result};

use async_trait::async_trait;
use mrm_core::DeviceRef;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Sampler that reports host RAM and no accelerator.
///
/// Used on machines without a supported accelerator driver; every device
/// profiles as RAM-only so callers evaluate the CPU-offload path.
#[derive(Clone)]
pub struct SystemSampler {
    system: Arc<Mutex<System>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Current host memory as (total, available) in GB. Blocking.
    pub(crate) fn host_memory(system: &Mutex<System>) -> (f64, f64) {
        let mut system = system.lock();
        system.refresh_memory();
        (
            bytes_to_gb(system.total_memory()),
            bytes_to_gb(system.available_memory()),
        )
    }

    /// Host memory queried off the async executor
    pub(crate) async fn host_memory_async(&self) -> Result<(f64, f64)> {
        let system = Arc::clone(&self.system);
        let memory = tokio::task::spawn_blocking(move || Self::host_memory(&system)).await?;
        Ok(memory)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareSampler for SystemSampler {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn query(&self, device: &DeviceRef) -> Result<HardwareProfile> {
        let (total_ram_gb, free_ram_gb) = self.host_memory_async().await?;
        debug!(
            device = %device,
            total_ram_gb,
            free_ram_gb,
            "Profiled host memory"
        );
        Ok(HardwareProfile::ram_only(device.clone(), total_ram_gb, free_ram_gb))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRef>> {
        Ok(vec![DeviceRef::cpu()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_sampler_reports_no_accelerator() {
        let sampler = SystemSampler::new();
        let profile = sampler.query(&DeviceRef::cuda(0)).await.unwrap();

        assert!(!profile.has_accelerator());
        assert_eq!(profile.total_vram_gb, 0.0);
        assert!(profile.total_ram_gb > 0.0);
        assert!(profile.free_ram_gb <= profile.total_ram_gb);
    }

    #[tokio::test]
    async fn test_system_sampler_lists_cpu() {
        let sampler = SystemSampler::new();
        assert_eq!(sampler.list_devices().await.unwrap(), vec![DeviceRef::cpu()]);
    }
}
