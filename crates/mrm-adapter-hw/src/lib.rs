//! # mrm-adapter-hw
//!
//! Accelerator and host memory profiling for the model resource manager.
//!
//! This crate provides:
//! - A per-device [`HardwareProfile`] snapshot (VRAM, RAM, compute tier)
//! - The [`HardwareSampler`] trait implemented by each backend
//! - [`HardwareProfiler`], which bounds every query with a timeout and falls
//!   back to the last good snapshot instead of failing or hanging
//!
//! ## Supported Backends
//!
//! - **System**: host RAM through the operating system; reports no accelerator
//! - **NVML**: NVIDIA Management Library (feature `nvml`)
//! - **Mock**: configurable devices for tests (feature `mock`)
//!
//! ## Example
//!
//! ```rust
//! use mrm_adapter_hw::{HardwareProfiler, MockSampler};
//! use mrm_core::{ComputeTier, DeviceRef};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sampler = MockSampler::new()
//!         .with_device(DeviceRef::cuda(0), 12.0, Some(ComputeTier::Ampere))
//!         .with_ram(32.0);
//!     let profiler = HardwareProfiler::new(Arc::new(sampler), Duration::from_secs(1));
//!
//!     let profile = profiler.profile(&DeviceRef::cuda(0)).await;
//!     assert_eq!(profile.total_vram_gb, 12.0);
//! }
//! ```

use thiserror::Error;

pub mod profile;
pub mod profiler;
pub mod system;

#[cfg(feature = "nvml")]
pub mod nvml;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use profile::HardwareProfile;
pub use profiler::{create_sampler, HardwareProfiler, HardwareSampler};
pub use system::SystemSampler;

#[cfg(any(feature = "mock", test))]
pub use mock::MockSampler;

/// Result type for hardware operations
pub type Result<T> = std::result::Result<T, HwError>;

/// Errors that can occur while querying hardware
#[derive(Error, Debug)]
pub enum HwError {
    #[error("Profiler backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Hardware query failed: {0}")]
    QueryFailed(String),

    #[error("NVML error: {0}")]
    NvmlError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl HwError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, HwError::QueryFailed(_) | HwError::Timeout(_) | HwError::Join(_))
    }
}

/// Bytes to gigabytes (base 1024)
pub(crate) fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}
