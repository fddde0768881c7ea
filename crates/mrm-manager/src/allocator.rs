//! Memory ledger
//!
//! Tracks how much VRAM each device and how much host RAM has been committed
//! to models, next to the transient canvas working set, the configured system
//! reserve and the estimate for other processes. Every reserve, adjust and
//! release runs under one lock so two admissions can never both see the same
//! headroom.

use crate::{ResourceError, EPSILON_GB};
use mrm_adapter_hw::HardwareProfile;
use mrm_core::{DeviceRef, MemoryAllocationBreakdown, MemoryConfig, Shortfall};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle for memory reserved in the ledger.
///
/// Releasing consumes the handle, so a reservation can be released at most
/// once and always by the amounts recorded here.
#[derive(Debug, PartialEq)]
pub struct Commitment {
    id: Uuid,
    device: DeviceRef,
    vram_gb: f64,
    ram_gb: f64,
}

impl Commitment {
    pub fn vram_gb(&self) -> f64 {
        self.vram_gb
    }

    pub fn ram_gb(&self) -> f64 {
        self.ram_gb
    }
}

/// A reservation that did not fit
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub shortfall: Shortfall,
    pub breakdown: MemoryAllocationBreakdown,
}

impl From<Rejection> for ResourceError {
    fn from(rejection: Rejection) -> Self {
        ResourceError::Rejected {
            device: rejection.breakdown.device.clone(),
            shortfall: rejection.shortfall,
            breakdown: Box::new(rejection.breakdown),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceLedger {
    total_vram_gb: f64,
    external_apps_vram_gb: f64,
    canvas_vram_gb: f64,
    canvas_ram_gb: f64,
    committed_vram_gb: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    devices: HashMap<DeviceRef, DeviceLedger>,
    total_ram_gb: f64,
    committed_ram_gb: f64,
    commitments: HashMap<Uuid, (f64, f64)>,
}

impl Ledger {
    fn breakdown(&self, device: &DeviceRef, config: &MemoryConfig) -> MemoryAllocationBreakdown {
        let canvas_ram_gb: f64 = self.devices.values().map(|d| d.canvas_ram_gb).sum();
        let (models_vram_gb, canvas_vram_gb, external_apps_vram_gb, total_vram_gb) =
            match self.devices.get(device) {
                Some(d) => (
                    d.committed_vram_gb,
                    d.canvas_vram_gb,
                    d.external_apps_vram_gb,
                    d.total_vram_gb,
                ),
                None => (0.0, 0.0, config.external_apps_vram_gb.unwrap_or(0.0), 0.0),
            };

        MemoryAllocationBreakdown {
            device: device.clone(),
            models_vram_gb,
            models_ram_gb: self.committed_ram_gb,
            canvas_history_vram_gb: canvas_vram_gb,
            canvas_history_ram_gb: canvas_ram_gb,
            system_reserve_vram_gb: config.system_reserve_vram_gb,
            system_reserve_ram_gb: config.system_reserve_ram_gb,
            external_apps_vram_gb,
            total_available_vram_gb: total_vram_gb,
            total_available_ram_gb: self.total_ram_gb,
        }
    }
}

/// Shortfall of a request against a breakdown; only requested dimensions count
fn shortfall_for(breakdown: &MemoryAllocationBreakdown, vram_gb: f64, ram_gb: f64) -> Shortfall {
    let vram_short = if vram_gb > 0.0 {
        vram_gb - breakdown.available_for_models_vram_gb()
    } else {
        0.0
    };
    let ram_short = if ram_gb > 0.0 {
        ram_gb - breakdown.available_for_models_ram_gb()
    } else {
        0.0
    };
    Shortfall::new(
        if vram_short > EPSILON_GB { vram_short } else { 0.0 },
        if ram_short > EPSILON_GB { ram_short } else { 0.0 },
    )
}

/// The VRAM/RAM ledger shared by every model slot
#[derive(Debug)]
pub struct MemoryAllocator {
    config: MemoryConfig,
    ledger: Mutex<Ledger>,
}

impl MemoryAllocator {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Refresh totals and the external-process estimate from a fresh profile.
    ///
    /// Without a configured estimate, VRAM in use that the ledger cannot
    /// account for is attributed to other processes. Host RAM is shared by
    /// every device, so a profile without a host reading leaves it untouched.
    pub fn observe(&self, profile: &HardwareProfile) {
        let mut ledger = self.ledger.lock();
        if profile.has_host_memory() {
            ledger.total_ram_gb = profile.total_ram_gb;
        }

        let device = ledger.devices.entry(profile.device.clone()).or_default();
        device.total_vram_gb = profile.total_vram_gb;
        device.external_apps_vram_gb = match self.config.external_apps_vram_gb {
            Some(estimate) => estimate,
            None => (profile.used_vram_gb() - device.committed_vram_gb - device.canvas_vram_gb).max(0.0),
        };

        debug!(
            device = %profile.device,
            total_vram_gb = device.total_vram_gb,
            external_apps_vram_gb = device.external_apps_vram_gb,
            "Ledger observed profile"
        );
    }

    /// Current accounting for a device
    pub fn snapshot(&self, device: &DeviceRef) -> MemoryAllocationBreakdown {
        self.ledger.lock().breakdown(device, &self.config)
    }

    /// Atomically check headroom and commit the requested amounts
    pub fn reserve(
        &self,
        device: &DeviceRef,
        vram_gb: f64,
        ram_gb: f64,
    ) -> std::result::Result<Commitment, Rejection> {
        let mut ledger = self.ledger.lock();
        let breakdown = ledger.breakdown(device, &self.config);
        let shortfall = shortfall_for(&breakdown, vram_gb, ram_gb);
        if !shortfall.is_zero() {
            debug!(device = %device, vram_gb, ram_gb, %shortfall, "Reservation rejected");
            return Err(Rejection { shortfall, breakdown });
        }

        ledger.devices.entry(device.clone()).or_default().committed_vram_gb += vram_gb;
        ledger.committed_ram_gb += ram_gb;

        let id = Uuid::new_v4();
        ledger.commitments.insert(id, (vram_gb, ram_gb));
        debug!(device = %device, vram_gb, ram_gb, commitment = %id, "Reserved memory");

        Ok(Commitment {
            id,
            device: device.clone(),
            vram_gb,
            ram_gb,
        })
    }

    /// Resize a commitment to the footprint a loader confirmed.
    ///
    /// Shrinking always succeeds; growth is checked against the headroom
    /// left by everything else. On rejection the commitment is unchanged.
    pub fn adjust(
        &self,
        commitment: &mut Commitment,
        vram_gb: f64,
        ram_gb: f64,
    ) -> std::result::Result<(), Rejection> {
        let mut ledger = self.ledger.lock();
        let breakdown = ledger.breakdown(&commitment.device, &self.config);
        let shortfall = shortfall_for(
            &breakdown,
            vram_gb - commitment.vram_gb,
            ram_gb - commitment.ram_gb,
        );
        if !shortfall.is_zero() {
            return Err(Rejection { shortfall, breakdown });
        }

        let device = ledger.devices.entry(commitment.device.clone()).or_default();
        device.committed_vram_gb = (device.committed_vram_gb - commitment.vram_gb + vram_gb).max(0.0);
        ledger.committed_ram_gb = (ledger.committed_ram_gb - commitment.ram_gb + ram_gb).max(0.0);
        ledger.commitments.insert(commitment.id, (vram_gb, ram_gb));

        debug!(
            device = %commitment.device,
            from_vram_gb = commitment.vram_gb,
            to_vram_gb = vram_gb,
            commitment = %commitment.id,
            "Adjusted commitment"
        );
        commitment.vram_gb = vram_gb;
        commitment.ram_gb = ram_gb;
        Ok(())
    }

    /// Return a commitment's recorded amounts to the pool
    pub fn release(&self, commitment: Commitment) {
        let mut ledger = self.ledger.lock();
        let Some((vram_gb, ram_gb)) = ledger.commitments.remove(&commitment.id) else {
            warn!(commitment = %commitment.id, "Releasing unknown commitment");
            return;
        };

        if let Some(device) = ledger.devices.get_mut(&commitment.device) {
            device.committed_vram_gb = (device.committed_vram_gb - vram_gb).max(0.0);
        }
        ledger.committed_ram_gb = (ledger.committed_ram_gb - ram_gb).max(0.0);
        debug!(device = %commitment.device, vram_gb, ram_gb, commitment = %commitment.id, "Released memory");
    }

    /// Record the transient canvas working set held on a device
    pub fn report_canvas_history(&self, device: &DeviceRef, vram_gb: f64, ram_gb: f64) {
        let mut ledger = self.ledger.lock();
        let entry = ledger.devices.entry(device.clone()).or_default();
        entry.canvas_vram_gb = vram_gb.max(0.0);
        entry.canvas_ram_gb = ram_gb.max(0.0);
        debug!(device = %device, vram_gb, ram_gb, "Canvas history updated");
    }

    /// Number of outstanding commitments
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().commitments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrm_core::ComputeTier;

    fn allocator() -> MemoryAllocator {
        let allocator = MemoryAllocator::new(MemoryConfig {
            system_reserve_vram_gb: 1.0,
            system_reserve_ram_gb: 4.0,
            external_apps_vram_gb: Some(0.0),
        });
        allocator.observe(&HardwareProfile::new(
            DeviceRef::cuda(0),
            12.0,
            12.0,
            32.0,
            32.0,
            Some(ComputeTier::Ampere),
        ));
        allocator
    }

    #[test]
    fn test_reserve_and_release() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        let first = allocator.reserve(&device, 4.0, 1.0).unwrap();
        let second = allocator.reserve(&device, 2.0, 0.5).unwrap();

        let breakdown = allocator.snapshot(&device);
        assert_eq!(breakdown.models_vram_gb, 6.0);
        assert_eq!(breakdown.models_ram_gb, 1.5);
        assert_eq!(breakdown.available_for_models_vram_gb(), 5.0);
        assert_eq!(allocator.outstanding(), 2);

        allocator.release(first);
        allocator.release(second);

        let breakdown = allocator.snapshot(&device);
        assert_eq!(breakdown.models_vram_gb, 0.0);
        assert_eq!(breakdown.models_ram_gb, 0.0);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_reserve_rejects_with_breakdown() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        let _held = allocator.reserve(&device, 6.0, 0.0).unwrap();
        let rejection = allocator.reserve(&device, 8.0, 0.0).unwrap_err();

        assert_eq!(rejection.shortfall, Shortfall::new(3.0, 0.0));
        assert_eq!(rejection.breakdown.models_vram_gb, 6.0);
        assert_eq!(rejection.breakdown.system_reserve_vram_gb, 1.0);
        assert_eq!(allocator.outstanding(), 1);
    }

    #[test]
    fn test_reserve_exact_fit() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        let held = allocator.reserve(&device, 11.0, 28.0).unwrap();
        assert_eq!(allocator.snapshot(&device).available_for_models_vram_gb(), 0.0);
        assert!(allocator.reserve(&device, 0.1, 0.0).is_err());

        // Offload variants need no VRAM
        let offload = allocator.reserve(&device, 0.0, 0.0).unwrap();
        allocator.release(offload);
        allocator.release(held);
    }

    #[test]
    fn test_release_uses_recorded_amounts() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        let mut commitment = allocator.reserve(&device, 4.0, 1.0).unwrap();
        allocator.adjust(&mut commitment, 4.5, 1.0).unwrap();
        assert_eq!(commitment.vram_gb(), 4.5);
        assert_eq!(allocator.snapshot(&device).models_vram_gb, 4.5);

        allocator.release(commitment);
        assert_eq!(allocator.snapshot(&device).models_vram_gb, 0.0);
    }

    #[test]
    fn test_adjust_rejects_growth_past_budget() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        let _other = allocator.reserve(&device, 6.0, 0.0).unwrap();
        let mut commitment = allocator.reserve(&device, 4.0, 0.0).unwrap();

        let rejection = allocator.adjust(&mut commitment, 6.0, 0.0).unwrap_err();
        assert_eq!(rejection.shortfall, Shortfall::new(1.0, 0.0));
        assert_eq!(commitment.vram_gb(), 4.0);
        assert_eq!(allocator.snapshot(&device).models_vram_gb, 10.0);
    }

    #[test]
    fn test_canvas_history_counts_against_budget() {
        let allocator = allocator();
        let device = DeviceRef::cuda(0);

        allocator.report_canvas_history(&device, 3.0, 2.0);
        let breakdown = allocator.snapshot(&device);
        assert_eq!(breakdown.canvas_history_vram_gb, 3.0);
        assert_eq!(breakdown.canvas_history_ram_gb, 2.0);
        assert_eq!(breakdown.available_for_models_vram_gb(), 8.0);

        assert!(allocator.reserve(&device, 9.0, 0.0).is_err());
    }

    #[test]
    fn test_external_estimate_from_profile() {
        let allocator = MemoryAllocator::new(MemoryConfig {
            system_reserve_vram_gb: 1.0,
            system_reserve_ram_gb: 0.0,
            external_apps_vram_gb: None,
        });
        let device = DeviceRef::cuda(0);
        allocator.observe(&HardwareProfile::new(
            device.clone(),
            12.0,
            12.0,
            32.0,
            32.0,
            Some(ComputeTier::Ampere),
        ));
        let held = allocator.reserve(&device, 4.0, 0.0).unwrap();

        // 4 GB is ours, the other 3 GB in use belong to someone else
        allocator.observe(&HardwareProfile::new(
            device.clone(),
            12.0,
            5.0,
            32.0,
            32.0,
            Some(ComputeTier::Ampere),
        ));
        let breakdown = allocator.snapshot(&device);
        assert!((breakdown.external_apps_vram_gb - 3.0).abs() < 1e-9);
        assert!((breakdown.available_for_models_vram_gb() - 4.0).abs() < 1e-9);

        allocator.release(held);
    }

    #[test]
    fn test_unavailable_device_keeps_host_ram() {
        let allocator = allocator();
        let held = allocator.reserve(&DeviceRef::cuda(0), 0.0, 8.0).unwrap();

        allocator.observe(&HardwareProfile::unavailable(DeviceRef::cuda(1)));

        let breakdown = allocator.snapshot(&DeviceRef::cuda(0));
        assert_eq!(breakdown.total_available_ram_gb, 32.0);
        assert_eq!(breakdown.available_for_models_ram_gb(), 20.0);
        assert_eq!(breakdown.total_available_vram_gb, 12.0);
        assert_eq!(allocator.snapshot(&DeviceRef::cuda(1)).total_available_ram_gb, 32.0);
        assert!(allocator.reserve(&DeviceRef::cuda(0), 0.0, 16.0).is_ok());

        allocator.release(held);
    }

    #[test]
    fn test_rejection_into_resource_error() {
        let allocator = allocator();
        let rejection = allocator.reserve(&DeviceRef::cuda(0), 20.0, 0.0).unwrap_err();
        let err: ResourceError = rejection.into();
        assert_eq!(err.category(), "rejected");
        assert_eq!(err.shortfall(), Some(Shortfall::new(9.0, 0.0)));
    }
}
