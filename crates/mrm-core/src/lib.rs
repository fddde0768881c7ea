//! # mrm-core
//!
//! Core types, traits, and utilities for the model resource manager.
//!
//! This crate provides the data structures and interfaces shared by the
//! profiler, the manager and the CLI. It includes:
//!
//! - Model types, device handles, precisions and variants
//! - Per-slot lifecycle records and memory breakdown snapshots
//! - The loader contract implemented by model-specific code
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod state;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    CatalogEntryConfig, Config, LoggingConfig, MemoryConfig, MockDeviceConfig, ModelSlotConfig,
    ProfilerBackend, ProfilerConfig,
};
pub use error::{Error, Result};
pub use state::{ActiveModelInfo, MemoryAllocationBreakdown, ModelState};
pub use traits::{Footprint, LoadRequest, LoaderCall, MockLoaderBehavior, MockModelLoader, ModelLoader};
pub use types::{ComputeTier, DeviceRef, ModelType, Placement, Precision, Shortfall, Variant};
