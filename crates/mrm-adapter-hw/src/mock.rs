//! Mock hardware sampler for testing

use crate::profile::HardwareProfile;
use crate::profiler::HardwareSampler;
use crate::{HwError, Result};

use async_trait::async_trait;
use mrm_core::{ComputeTier, DeviceRef, ProfilerConfig};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Mock hardware sampler with settable devices, delay and failures
#[derive(Clone, Default)]
pub struct MockSampler {
    state: Arc<RwLock<MockHardware>>,
}

#[derive(Debug, Default)]
struct MockHardware {
    devices: BTreeMap<DeviceRef, MockDevice>,
    total_ram_gb: f64,
    free_ram_gb: f64,
    delay: Duration,
    failing: bool,
}

#[derive(Debug, Clone)]
struct MockDevice {
    total_vram_gb: f64,
    free_vram_gb: f64,
    compute_tier: Option<ComputeTier>,
}

impl MockSampler {
    /// Create a mock sampler with no devices and no RAM
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock sampler from the mock section of the profiler config
    pub fn from_config(config: &ProfilerConfig) -> Self {
        let sampler = config
            .mock_devices
            .iter()
            .fold(Self::new(), |sampler, device| {
                sampler.with_device(device.device.clone(), device.total_vram_gb, device.compute_tier)
            });
        sampler.with_ram(config.mock_ram_gb)
    }

    /// Add an accelerator; free VRAM starts equal to total
    pub fn with_device(self, device: DeviceRef, total_vram_gb: f64, tier: Option<ComputeTier>) -> Self {
        self.state.write().devices.insert(
            device,
            MockDevice {
                total_vram_gb,
                free_vram_gb: total_vram_gb,
                compute_tier: tier,
            },
        );
        self
    }

    /// Set host RAM; free RAM starts equal to total
    pub fn with_ram(self, total_ram_gb: f64) -> Self {
        {
            let mut state = self.state.write();
            state.total_ram_gb = total_ram_gb;
            state.free_ram_gb = total_ram_gb;
        }
        self
    }

    /// Simulate VRAM taken by other processes
    pub fn set_free_vram(&self, device: &DeviceRef, free_vram_gb: f64) {
        if let Some(mock) = self.state.write().devices.get_mut(device) {
            mock.free_vram_gb = free_vram_gb;
        }
    }

    pub fn set_free_ram(&self, free_ram_gb: f64) {
        self.state.write().free_ram_gb = free_ram_gb;
    }

    /// Make every query take this long
    pub fn set_delay(&self, delay: Duration) {
        self.state.write().delay = delay;
    }

    /// Make every query fail
    pub fn set_failing(&self, failing: bool) {
        self.state.write().failing = failing;
    }
}

#[async_trait]
impl HardwareSampler for MockSampler {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn query(&self, device: &DeviceRef) -> Result<HardwareProfile> {
        let delay = self.state.read().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read();
        if state.failing {
            return Err(HwError::QueryFailed(format!("simulated failure for {}", device)));
        }

        let profile = match state.devices.get(device) {
            Some(mock) => HardwareProfile::new(
                device.clone(),
                mock.total_vram_gb,
                mock.free_vram_gb,
                state.total_ram_gb,
                state.free_ram_gb,
                mock.compute_tier,
            ),
            None if device.accelerator_index().is_none() => {
                HardwareProfile::ram_only(device.clone(), state.total_ram_gb, state.free_ram_gb)
            }
            None => return Err(HwError::DeviceNotFound(device.to_string())),
        };

        debug!("Retrieved profile for mock device {}", device);
        Ok(profile)
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRef>> {
        Ok(self.state.read().devices.keys().cloned().collect())
    }
}
