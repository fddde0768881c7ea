//! # mrm-manager
//!
//! Admission control, eviction and memory accounting for model workloads
//! that share accelerator and host memory on one machine.
//!
//! This crate provides:
//! - [`ModelRegistry`]: static catalog of model variants and device pins
//! - [`QuantizationStrategy`]: deterministic best-fit variant selection
//! - [`MemoryAllocator`]: the per-device VRAM/RAM ledger
//! - [`ModelResourceManager`]: the lifecycle state machine, admission and
//!   LRU eviction policy driving external loaders
//!
//! ## Example
//!
//! ```rust
//! use mrm_adapter_hw::{HardwareProfiler, MockSampler};
//! use mrm_core::{ComputeTier, DeviceRef, MemoryConfig, MockModelLoader, ModelType, Precision, Variant};
//! use mrm_manager::{MemoryAllocator, ModelRegistry, ModelResourceManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sampler = MockSampler::new()
//!     .with_device(DeviceRef::cuda(0), 12.0, Some(ComputeTier::Ampere))
//!     .with_ram(32.0);
//! let registry = ModelRegistry::new(DeviceRef::cuda(0))
//!     .with_entry(ModelType::Tts, "xtts", vec![Variant::accelerator(Precision::Fp16, 2.0, 0.5)]);
//!
//! let manager = ModelResourceManager::builder(registry)
//!     .profiler(HardwareProfiler::new(Arc::new(sampler), Duration::from_secs(1)))
//!     .allocator(MemoryAllocator::new(MemoryConfig::default()))
//!     .shared_loader(Arc::new(MockModelLoader::new()))
//!     .build()?;
//!
//! let outcome = manager.activate(ModelType::Tts).await?;
//! println!("Loaded {}", outcome.active_variant);
//! # Ok(())
//! # }
//! ```

use mrm_core::{DeviceRef, MemoryAllocationBreakdown, ModelState, ModelType, Shortfall};
use thiserror::Error;

pub mod allocator;
pub mod eviction;
pub mod manager;
pub mod quantization;
pub mod registry;

// Re-export commonly used types
pub use allocator::{Commitment, MemoryAllocator, Rejection};
pub use eviction::{EvictionCandidate, EvictionPlan};
pub use manager::{ActivateOptions, ActivationOutcome, ManagerBuilder, ManagerSnapshot, ModelResourceManager};
pub use quantization::{QuantizationStrategy, Selection};
pub use registry::{CatalogEntry, ModelRegistry};

/// Result type for manager operations
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Errors returned by the model resource manager.
///
/// None of these are fatal: the worst outcome is that a model cannot be
/// activated right now, and the slot is always back in a stable state.
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    #[error("{model_type} is already {state}, retry later")]
    AlreadyInTransition { model_type: ModelType, state: ModelState },

    #[error("{model_type} does not fit, short by {shortfall}")]
    Infeasible { model_type: ModelType, shortfall: Shortfall },

    #[error("{model_type} needs memory held by pinned or busy models, short by {shortfall}")]
    PinnedResourceUnavailable { model_type: ModelType, shortfall: Shortfall },

    #[error("Loader failed for {model_type}: {message}")]
    LoaderFailed { model_type: ModelType, message: String },

    #[error("Unloader failed for {model_type}: {message}")]
    UnloaderFailed { model_type: ModelType, message: String },

    #[error("{model_type} reported a footprint that exceeds its budget by {shortfall}")]
    FootprintExceeded { model_type: ModelType, shortfall: Shortfall },

    #[error("Cannot {operation} {model_type} while {state}")]
    InvalidState {
        model_type: ModelType,
        state: ModelState,
        operation: &'static str,
    },

    #[error("Unknown model type: {0}")]
    UnknownModelType(ModelType),

    #[error("No variant of {model_type} runs on this hardware")]
    NoEligibleVariant { model_type: ModelType },

    #[error("Ledger rejected reservation on {device}, short by {shortfall}")]
    Rejected {
        device: DeviceRef,
        shortfall: Shortfall,
        breakdown: Box<MemoryAllocationBreakdown>,
    },

    #[error("Activation of {0} was cancelled")]
    Cancelled(ModelType),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResourceError {
    /// Check if the caller may retry later with a chance of success
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResourceError::AlreadyInTransition { .. }
                | ResourceError::Infeasible { .. }
                | ResourceError::PinnedResourceUnavailable { .. }
                | ResourceError::Rejected { .. }
                | ResourceError::Cancelled(_)
        )
    }

    /// Shortfall carried by admission failures
    pub fn shortfall(&self) -> Option<Shortfall> {
        match self {
            ResourceError::Infeasible { shortfall, .. }
            | ResourceError::PinnedResourceUnavailable { shortfall, .. }
            | ResourceError::FootprintExceeded { shortfall, .. }
            | ResourceError::Rejected { shortfall, .. } => Some(*shortfall),
            _ => None,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ResourceError::AlreadyInTransition { .. } => "already_in_transition",
            ResourceError::Infeasible { .. } => "infeasible",
            ResourceError::PinnedResourceUnavailable { .. } => "pinned_resource_unavailable",
            ResourceError::LoaderFailed { .. } => "loader_failed",
            ResourceError::UnloaderFailed { .. } => "unloader_failed",
            ResourceError::FootprintExceeded { .. } => "footprint_exceeded",
            ResourceError::InvalidState { .. } => "invalid_state",
            ResourceError::UnknownModelType(_) => "unknown_model_type",
            ResourceError::NoEligibleVariant { .. } => "no_eligible_variant",
            ResourceError::Rejected { .. } => "rejected",
            ResourceError::Cancelled(_) => "cancelled",
            ResourceError::Configuration(_) => "configuration",
            ResourceError::Internal(_) => "internal",
        }
    }
}

/// Tolerance for floating-point memory comparisons, in GB
pub(crate) const EPSILON_GB: f64 = 1e-9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ResourceError::Infeasible {
            model_type: ModelType::ImageGen,
            shortfall: Shortfall::new(1.0, 0.0),
        };
        assert!(err.is_retryable());
        assert_eq!(err.shortfall(), Some(Shortfall::new(1.0, 0.0)));
        assert_eq!(err.category(), "infeasible");

        let err = ResourceError::LoaderFailed {
            model_type: ModelType::Llm,
            message: "oom".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.shortfall().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = ResourceError::AlreadyInTransition {
            model_type: ModelType::Tts,
            state: ModelState::Loading,
        };
        assert_eq!(err.to_string(), "tts is already loading, retry later");

        let err = ResourceError::InvalidState {
            model_type: ModelType::Llm,
            state: ModelState::Busy,
            operation: "deactivate",
        };
        assert_eq!(err.to_string(), "Cannot deactivate llm while busy");
    }
}
