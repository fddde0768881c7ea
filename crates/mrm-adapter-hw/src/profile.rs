//! Hardware profile snapshots

use chrono::{DateTime, Utc};
use mrm_core::{ComputeTier, DeviceRef};
use serde::{Deserialize, Serialize};

/// Memory and capability snapshot of one device plus the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub device: DeviceRef,
    pub total_vram_gb: f64,
    pub free_vram_gb: f64,
    pub total_ram_gb: f64,
    pub free_ram_gb: f64,

    /// `None` when the device has no usable accelerator
    pub compute_tier: Option<ComputeTier>,

    pub profiled_at: DateTime<Utc>,
}

impl HardwareProfile {
    /// Profile of a device with an accelerator
    pub fn new(
        device: DeviceRef,
        total_vram_gb: f64,
        free_vram_gb: f64,
        total_ram_gb: f64,
        free_ram_gb: f64,
        compute_tier: Option<ComputeTier>,
    ) -> Self {
        Self {
            device,
            total_vram_gb: total_vram_gb.max(0.0),
            free_vram_gb: free_vram_gb.clamp(0.0, total_vram_gb.max(0.0)),
            total_ram_gb: total_ram_gb.max(0.0),
            free_ram_gb: free_ram_gb.clamp(0.0, total_ram_gb.max(0.0)),
            compute_tier,
            profiled_at: Utc::now(),
        }
    }

    /// Profile of a device without an accelerator: zero VRAM, no tier
    pub fn ram_only(device: DeviceRef, total_ram_gb: f64, free_ram_gb: f64) -> Self {
        Self::new(device, 0.0, 0.0, total_ram_gb, free_ram_gb, None)
    }

    /// Placeholder used when nothing was ever profiled successfully
    pub fn unavailable(device: DeviceRef) -> Self {
        Self::new(device, 0.0, 0.0, 0.0, 0.0, None)
    }

    pub fn has_accelerator(&self) -> bool {
        self.compute_tier.is_some() && self.total_vram_gb > 0.0
    }

    /// False for placeholders that carry no host memory reading
    pub fn has_host_memory(&self) -> bool {
        self.total_ram_gb > 0.0
    }

    /// VRAM in use by anyone, in GB
    pub fn used_vram_gb(&self) -> f64 {
        (self.total_vram_gb - self.free_vram_gb).max(0.0)
    }

    /// Age of this snapshot in milliseconds
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.profiled_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_only_profile() {
        let profile = HardwareProfile::ram_only(DeviceRef::cpu(), 32.0, 20.0);
        assert!(!profile.has_accelerator());
        assert_eq!(profile.total_vram_gb, 0.0);
        assert!(profile.compute_tier.is_none());
        assert_eq!(profile.free_ram_gb, 20.0);
        assert!(profile.has_host_memory());
    }

    #[test]
    fn test_unavailable_profile_has_no_host_memory() {
        let profile = HardwareProfile::unavailable(DeviceRef::cuda(1));
        assert!(!profile.has_host_memory());
        assert!(!profile.has_accelerator());
        assert!(profile.age_ms() >= 0);
    }

    #[test]
    fn test_free_is_clamped_to_total() {
        let profile = HardwareProfile::new(
            DeviceRef::cuda(0),
            12.0,
            14.0,
            32.0,
            -1.0,
            Some(ComputeTier::Ampere),
        );
        assert_eq!(profile.free_vram_gb, 12.0);
        assert_eq!(profile.free_ram_gb, 0.0);
        assert_eq!(profile.used_vram_gb(), 0.0);
        assert!(profile.has_accelerator());
    }
}
