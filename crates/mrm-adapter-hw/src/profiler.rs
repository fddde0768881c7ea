//! Hardware profiling with bounded query time

use crate::profile::HardwareProfile;
use crate::system::SystemSampler;
use crate::{HwError, Result};

use async_trait::async_trait;
use mrm_core::{DeviceRef, ProfilerBackend, ProfilerConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Trait defining the interface for hardware sampler backends
#[async_trait]
pub trait HardwareSampler: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Query one device. Blocking driver calls must not run on the async
    /// executor, so the profiler's timeout can fire.
    async fn query(&self, device: &DeviceRef) -> Result<HardwareProfile>;

    /// Devices this backend can see
    async fn list_devices(&self) -> Result<Vec<DeviceRef>>;
}

/// Read-only hardware profiler.
///
/// Every query is bounded by `query_timeout`; a slow or failing backend
/// yields the last good snapshot for that device (or an empty profile if
/// none exists), never an error.
pub struct HardwareProfiler {
    sampler: Arc<dyn HardwareSampler>,
    query_timeout: Duration,
    last_good: RwLock<HashMap<DeviceRef, HardwareProfile>>,
}

impl HardwareProfiler {
    /// Create a profiler over an existing sampler
    pub fn new(sampler: Arc<dyn HardwareSampler>, query_timeout: Duration) -> Self {
        info!(
            "Creating hardware profiler for backend: {} (timeout {:?})",
            sampler.name(),
            query_timeout
        );
        Self {
            sampler,
            query_timeout,
            last_good: RwLock::new(HashMap::new()),
        }
    }

    /// Create a profiler for the configured backend
    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self::new(create_sampler(config), config.query_timeout())
    }

    /// Profile a device
    pub async fn profile(&self, device: &DeviceRef) -> HardwareProfile {
        match tokio::time::timeout(self.query_timeout, self.sampler.query(device)).await {
            Ok(Ok(profile)) => {
                debug!(
                    device = %device,
                    total_vram_gb = profile.total_vram_gb,
                    free_vram_gb = profile.free_vram_gb,
                    free_ram_gb = profile.free_ram_gb,
                    "Profiled device"
                );
                self.last_good.write().insert(device.clone(), profile.clone());
                profile
            }
            Ok(Err(e)) => {
                warn!(
                    device = %device,
                    retryable = e.is_retryable(),
                    "Hardware query failed, using last snapshot: {}",
                    e
                );
                self.fallback(device)
            }
            Err(_) => {
                warn!(
                    device = %device,
                    "Hardware query exceeded {:?}, using last snapshot",
                    self.query_timeout
                );
                self.fallback(device)
            }
        }
    }

    /// Devices visible to the backend; empty if the backend cannot enumerate
    pub async fn list_devices(&self) -> Vec<DeviceRef> {
        match tokio::time::timeout(self.query_timeout, self.sampler.list_devices()).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("Device enumeration exceeded {:?}", self.query_timeout);
                Vec::new()
            }
        }
    }

    /// Last successful snapshot for a device
    pub fn last_snapshot(&self, device: &DeviceRef) -> Option<HardwareProfile> {
        self.last_good.read().get(device).cloned()
    }

    pub fn backend_name(&self) -> &'static str {
        self.sampler.name()
    }

    fn fallback(&self, device: &DeviceRef) -> HardwareProfile {
        self.last_snapshot(device)
            .unwrap_or_else(|| HardwareProfile::unavailable(device.clone()))
    }
}

/// Create a backend-specific sampler.
///
/// Backends that cannot start (no driver, feature disabled) degrade to the
/// system sampler, which reports host memory and no accelerator.
pub fn create_sampler(config: &ProfilerConfig) -> Arc<dyn HardwareSampler> {
    match config.backend {
        #[cfg(any(feature = "mock", test))]
        ProfilerBackend::Mock => Arc::new(crate::mock::MockSampler::from_config(config)),

        #[cfg(feature = "nvml")]
        ProfilerBackend::Nvml => match crate::nvml::NvmlSampler::new() {
            Ok(sampler) => Arc::new(sampler),
            Err(e) => {
                warn!("NVML unavailable, profiling host memory only: {}", e);
                Arc::new(SystemSampler::new())
            }
        },

        ProfilerBackend::System => Arc::new(SystemSampler::new()),

        #[allow(unreachable_patterns)]
        backend => {
            let error = HwError::UnsupportedBackend(backend.to_string());
            warn!("{}, profiling host memory only", error);
            Arc::new(SystemSampler::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSampler;
    use mrm_core::ComputeTier;

    fn mock_sampler() -> MockSampler {
        MockSampler::new()
            .with_device(DeviceRef::cuda(0), 12.0, Some(ComputeTier::Ampere))
            .with_ram(32.0)
    }

    #[tokio::test]
    async fn test_profile_success_is_cached() {
        let sampler = mock_sampler();
        let profiler = HardwareProfiler::new(Arc::new(sampler), Duration::from_millis(200));

        assert!(profiler.last_snapshot(&DeviceRef::cuda(0)).is_none());
        let profile = profiler.profile(&DeviceRef::cuda(0)).await;
        assert_eq!(profile.total_vram_gb, 12.0);
        assert_eq!(profile.compute_tier, Some(ComputeTier::Ampere));
        assert!(profiler.last_snapshot(&DeviceRef::cuda(0)).is_some());
    }

    #[tokio::test]
    async fn test_slow_sampler_returns_last_snapshot() {
        let sampler = mock_sampler();
        let profiler = HardwareProfiler::new(Arc::new(sampler.clone()), Duration::from_millis(50));

        let first = profiler.profile(&DeviceRef::cuda(0)).await;

        sampler.set_free_vram(&DeviceRef::cuda(0), 3.0);
        sampler.set_delay(Duration::from_secs(5));

        let started = std::time::Instant::now();
        let second = profiler.profile(&DeviceRef::cuda(0)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_failing_sampler_without_history_is_empty() {
        let sampler = mock_sampler();
        sampler.set_failing(true);
        let profiler = HardwareProfiler::new(Arc::new(sampler), Duration::from_millis(50));

        let profile = profiler.profile(&DeviceRef::cuda(0)).await;
        assert_eq!(profile.total_vram_gb, 0.0);
        assert_eq!(profile.total_ram_gb, 0.0);
        assert!(profile.compute_tier.is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_an_error() {
        let profiler = HardwareProfiler::new(Arc::new(mock_sampler()), Duration::from_millis(50));
        let profile = profiler.profile(&DeviceRef::cuda(9)).await;
        assert!(!profile.has_accelerator());
    }

    #[tokio::test]
    async fn test_create_sampler_from_config() {
        let config = ProfilerConfig {
            backend: ProfilerBackend::Mock,
            ..Default::default()
        };
        let profiler = HardwareProfiler::from_config(&config);
        assert_eq!(profiler.backend_name(), "mock");

        let devices = profiler.list_devices().await;
        assert_eq!(devices, vec![DeviceRef::cuda(0)]);
    }
}
