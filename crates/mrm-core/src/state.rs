//! State representations for model slots and device memory
//!
//! These structures describe the lifecycle of each model-type slot and the
//! memory accounting snapshot used for admission decisions and display.

use crate::{DeviceRef, ModelType, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a model-type slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    /// Loaded and processing at least one job
    Busy,
    Unloading,
}

impl ModelState {
    /// Model weights are resident (Loaded or Busy)
    pub fn is_resident(&self) -> bool {
        matches!(self, ModelState::Loaded | ModelState::Busy)
    }

    /// A load or unload is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ModelState::Loading | ModelState::Unloading)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Unloaded => write!(f, "unloaded"),
            ModelState::Loading => write!(f, "loading"),
            ModelState::Loaded => write!(f, "loaded"),
            ModelState::Busy => write!(f, "busy"),
            ModelState::Unloading => write!(f, "unloading"),
        }
    }
}

/// Per-slot record; exactly one exists per model type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModelInfo {
    /// Checkpoint currently selected for this slot
    pub model_id: String,

    pub model_type: ModelType,

    pub state: ModelState,

    /// Device this slot is pinned to
    pub device: DeviceRef,

    /// Variant resident on the device, if any
    pub active_variant: Option<Variant>,

    /// VRAM committed in the ledger for this slot, in GB
    pub vram_allocated_gb: f64,

    /// RAM committed in the ledger for this slot, in GB
    pub ram_allocated_gb: f64,

    /// Cross-model dependency pin: never evict while set
    pub pinned: bool,

    /// Outstanding jobs reported by the owning workload
    pub busy_jobs: u32,

    /// Wall-clock time of the last activation or job signal
    pub last_used: Option<DateTime<Utc>>,

    /// Logical clock value of the last use; orders LRU eviction
    pub use_seq: u64,

    /// Message of the most recent load/unload failure
    pub last_error: Option<String>,
}

impl ActiveModelInfo {
    /// Create an unloaded slot record
    pub fn new(model_type: ModelType, model_id: impl Into<String>, device: DeviceRef) -> Self {
        Self {
            model_id: model_id.into(),
            model_type,
            state: ModelState::Unloaded,
            device,
            active_variant: None,
            vram_allocated_gb: 0.0,
            ram_allocated_gb: 0.0,
            pinned: false,
            busy_jobs: 0,
            last_used: None,
            use_seq: 0,
            last_error: None,
        }
    }

    /// Whether eviction may pick this slot
    pub fn can_unload(&self) -> bool {
        !self.pinned && self.state == ModelState::Loaded
    }

    /// Record a use at the given logical clock value
    pub fn touch(&mut self, seq: u64) {
        self.use_seq = seq;
        self.last_used = Some(Utc::now());
    }

    /// Mark the slot as resident with the given variant and committed amounts
    pub fn mark_loaded(&mut self, variant: Variant, vram_gb: f64, ram_gb: f64) {
        self.state = ModelState::Loaded;
        self.active_variant = Some(variant);
        self.vram_allocated_gb = vram_gb;
        self.ram_allocated_gb = ram_gb;
        self.busy_jobs = 0;
        self.last_error = None;
    }

    /// Reset the slot to an empty, unloaded record
    pub fn mark_unloaded(&mut self) {
        self.state = ModelState::Unloaded;
        self.active_variant = None;
        self.vram_allocated_gb = 0.0;
        self.ram_allocated_gb = 0.0;
        self.busy_jobs = 0;
    }
}

/// Point-in-time memory accounting for one device (RAM figures are host-wide)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryAllocationBreakdown {
    pub device: DeviceRef,

    /// Committed to resident models on this device
    pub models_vram_gb: f64,

    /// Committed to resident models across the host
    pub models_ram_gb: f64,

    /// Transient non-model working set (image history)
    pub canvas_history_vram_gb: f64,
    pub canvas_history_ram_gb: f64,

    /// Configured floor never handed to models
    pub system_reserve_vram_gb: f64,
    pub system_reserve_ram_gb: f64,

    /// Configured or profiled estimate of third-party consumers
    pub external_apps_vram_gb: f64,

    /// Profiled totals
    pub total_available_vram_gb: f64,
    pub total_available_ram_gb: f64,
}

impl MemoryAllocationBreakdown {
    /// Everything on the device that is not free for a new model
    pub fn committed_vram_gb(&self) -> f64 {
        self.models_vram_gb
            + self.canvas_history_vram_gb
            + self.system_reserve_vram_gb
            + self.external_apps_vram_gb
    }

    pub fn committed_ram_gb(&self) -> f64 {
        self.models_ram_gb + self.canvas_history_ram_gb + self.system_reserve_ram_gb
    }

    /// VRAM a new model could still claim
    pub fn available_for_models_vram_gb(&self) -> f64 {
        (self.total_available_vram_gb - self.committed_vram_gb()).max(0.0)
    }

    /// RAM a new model could still claim
    pub fn available_for_models_ram_gb(&self) -> f64 {
        (self.total_available_ram_gb - self.committed_ram_gb()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Precision;

    #[test]
    fn test_model_state_helpers() {
        assert!(ModelState::Loaded.is_resident());
        assert!(ModelState::Busy.is_resident());
        assert!(!ModelState::Loading.is_resident());
        assert!(ModelState::Loading.is_transitioning());
        assert!(ModelState::Unloading.is_transitioning());
        assert!(!ModelState::Unloaded.is_transitioning());
    }

    #[test]
    fn test_can_unload() {
        let mut info = ActiveModelInfo::new(ModelType::Llm, "llama", DeviceRef::cuda(0));
        assert!(!info.can_unload());

        info.mark_loaded(Variant::accelerator(Precision::Fp16, 4.0, 1.0), 4.0, 1.0);
        assert!(info.can_unload());

        info.pinned = true;
        assert!(!info.can_unload());

        info.pinned = false;
        info.state = ModelState::Busy;
        assert!(!info.can_unload());
    }

    #[test]
    fn test_mark_unloaded_clears_allocation() {
        let mut info = ActiveModelInfo::new(ModelType::Tts, "bark", DeviceRef::cuda(0));
        info.mark_loaded(Variant::accelerator(Precision::Fp16, 2.0, 0.5), 2.0, 0.5);
        info.mark_unloaded();
        assert_eq!(info.state, ModelState::Unloaded);
        assert_eq!(info.vram_allocated_gb, 0.0);
        assert_eq!(info.ram_allocated_gb, 0.0);
        assert!(info.active_variant.is_none());
    }

    #[test]
    fn test_breakdown_headroom() {
        let breakdown = MemoryAllocationBreakdown {
            device: DeviceRef::cuda(0),
            models_vram_gb: 6.0,
            system_reserve_vram_gb: 1.0,
            total_available_vram_gb: 12.0,
            total_available_ram_gb: 32.0,
            models_ram_gb: 2.0,
            system_reserve_ram_gb: 4.0,
            ..Default::default()
        };
        assert_eq!(breakdown.available_for_models_vram_gb(), 5.0);
        assert_eq!(breakdown.available_for_models_ram_gb(), 26.0);
    }
}
