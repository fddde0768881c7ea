//! NVML (NVIDIA Management Library) backend

use crate::profile::HardwareProfile;
use crate::profiler::HardwareSampler;
use crate::system::SystemSampler;
use crate::{bytes_to_gb, HwError, Result};

use async_trait::async_trait;
use mrm_core::{ComputeTier, DeviceRef};
use nvml_wrapper::Nvml;
use std::sync::Arc;
use tracing::{debug, info};

/// NVML accelerator sampler; host RAM comes from the system sampler
pub struct NvmlSampler {
    nvml: Arc<Nvml>,
    host: SystemSampler,
}

struct AcceleratorReading {
    total_vram_gb: f64,
    free_vram_gb: f64,
    compute_tier: ComputeTier,
}

impl NvmlSampler {
    /// Initialize NVML
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| HwError::NvmlError(e.to_string()))?;
        let count = nvml
            .device_count()
            .map_err(|e| HwError::NvmlError(e.to_string()))?;
        info!("NVML initialized with {} device(s)", count);

        Ok(Self {
            nvml: Arc::new(nvml),
            host: SystemSampler::new(),
        })
    }

    fn read_device(nvml: &Nvml, index: u32) -> Result<AcceleratorReading> {
        let device = nvml
            .device_by_index(index)
            .map_err(|e| HwError::DeviceNotFound(format!("cuda:{}: {}", index, e)))?;
        let memory = device
            .memory_info()
            .map_err(|e| HwError::NvmlError(e.to_string()))?;
        let capability = device
            .cuda_compute_capability()
            .map_err(|e| HwError::NvmlError(e.to_string()))?;

        Ok(AcceleratorReading {
            total_vram_gb: bytes_to_gb(memory.total),
            free_vram_gb: bytes_to_gb(memory.free),
            compute_tier: ComputeTier::from_capability(
                capability.major.max(0) as u32,
                capability.minor.max(0) as u32,
            ),
        })
    }
}

#[async_trait]
impl HardwareSampler for NvmlSampler {
    fn name(&self) -> &'static str {
        "nvml"
    }

    async fn query(&self, device: &DeviceRef) -> Result<HardwareProfile> {
        let (total_ram_gb, free_ram_gb) = self.host.host_memory_async().await?;

        let Some(index) = device.accelerator_index() else {
            return Ok(HardwareProfile::ram_only(device.clone(), total_ram_gb, free_ram_gb));
        };

        let nvml = Arc::clone(&self.nvml);
        let reading = tokio::task::spawn_blocking(move || Self::read_device(&nvml, index)).await??;

        debug!(
            device = %device,
            total_vram_gb = reading.total_vram_gb,
            free_vram_gb = reading.free_vram_gb,
            tier = %reading.compute_tier,
            "Profiled accelerator"
        );

        Ok(HardwareProfile::new(
            device.clone(),
            reading.total_vram_gb,
            reading.free_vram_gb,
            total_ram_gb,
            free_ram_gb,
            Some(reading.compute_tier),
        ))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRef>> {
        let nvml = Arc::clone(&self.nvml);
        let count = tokio::task::spawn_blocking(move || nvml.device_count())
            .await?
            .map_err(|e| HwError::NvmlError(e.to_string()))?;
        Ok((0..count).map(DeviceRef::cuda).collect())
    }
}
