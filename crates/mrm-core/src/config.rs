//! Configuration management for the model resource manager
//!
//! Provides a unified configuration system that supports YAML files and
//! environment variable overrides on top of built-in defaults.

use crate::{ComputeTier, DeviceRef, ModelType, Precision, Result, Variant};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device used by model types without an explicit pin
    pub default_device: DeviceRef,

    /// Memory floors and external-consumer estimates
    pub memory: MemoryConfig,

    /// Hardware profiling configuration
    pub profiler: ProfilerConfig,

    /// Per-model-type slot settings
    pub models: BTreeMap<ModelType, ModelSlotConfig>,

    /// Catalog of loadable models and their variants
    pub catalog: Vec<CatalogEntryConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add configuration file if it exists
        if let Ok(config_path) = std::env::var("MRM_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            // Try common config file locations
            for path in &["./mrm.yaml", "/etc/mrm/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // Add environment variables with MRM_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("MRM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        // Validate the configuration
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.profiler.validate()?;

        if self.catalog.is_empty() {
            return Err(crate::Error::config("Catalog must contain at least one model"));
        }

        let mut seen = HashSet::new();
        for entry in &self.catalog {
            entry.validate()?;
            if !seen.insert((entry.model_type.clone(), entry.model_id.clone())) {
                return Err(crate::Error::config(format!(
                    "Duplicate catalog entry for {}/{}",
                    entry.model_type, entry.model_id
                )));
            }
        }

        for (model_type, slot) in &self.models {
            if let Some(model_id) = &slot.model_id {
                if !seen.contains(&(model_type.clone(), model_id.clone())) {
                    return Err(crate::Error::config(format!(
                        "Model type {} selects unknown model id {}",
                        model_type, model_id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Device a model type is pinned to
    pub fn device_for(&self, model_type: &ModelType) -> DeviceRef {
        self.models
            .get(model_type)
            .and_then(|slot| slot.device.clone())
            .unwrap_or_else(|| self.default_device.clone())
    }

    /// Initial pin state of a model type's slot
    pub fn prevent_unload(&self, model_type: &ModelType) -> bool {
        self.models
            .get(model_type)
            .map(|slot| slot.prevent_unload)
            .unwrap_or(false)
    }

    /// Every device referenced by the configuration, in stable order
    pub fn devices(&self) -> Vec<DeviceRef> {
        let mut devices: BTreeSet<DeviceRef> = self
            .catalog
            .iter()
            .map(|entry| self.device_for(&entry.model_type))
            .collect();
        devices.insert(self.default_device.clone());
        devices.into_iter().collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_device: DeviceRef::cuda(0),
            memory: MemoryConfig::default(),
            profiler: ProfilerConfig::default(),
            models: BTreeMap::new(),
            catalog: CatalogEntryConfig::builtin(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Memory floors and external-consumer estimates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// VRAM never handed to models, per device
    pub system_reserve_vram_gb: f64,

    /// Host RAM never handed to models
    pub system_reserve_ram_gb: f64,

    /// Fixed estimate of VRAM used by other processes.
    /// When unset it is derived from each profile.
    pub external_apps_vram_gb: Option<f64>,
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.system_reserve_vram_gb < 0.0 || self.system_reserve_ram_gb < 0.0 {
            return Err(crate::Error::config("System reserves cannot be negative"));
        }
        if matches!(self.external_apps_vram_gb, Some(gb) if gb < 0.0) {
            return Err(crate::Error::config("External apps estimate cannot be negative"));
        }
        Ok(())
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            system_reserve_vram_gb: 1.0,
            system_reserve_ram_gb: 4.0,
            external_apps_vram_gb: None,
        }
    }
}

/// Hardware profiling backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerBackend {
    /// Static, configurable devices for tests and dry runs
    Mock,
    /// Host memory via the operating system; no accelerator data
    System,
    /// NVIDIA Management Library
    Nvml,
}

impl std::fmt::Display for ProfilerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfilerBackend::Mock => write!(f, "mock"),
            ProfilerBackend::System => write!(f, "system"),
            ProfilerBackend::Nvml => write!(f, "nvml"),
        }
    }
}

/// Hardware profiling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub backend: ProfilerBackend,

    /// Upper bound on a single hardware query
    pub query_timeout_ms: u64,

    /// Devices exposed by the mock backend
    pub mock_devices: Vec<MockDeviceConfig>,

    /// Host RAM reported by the mock backend
    pub mock_ram_gb: f64,
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.query_timeout_ms == 0 {
            return Err(crate::Error::config("Profiler query timeout must be > 0"));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            backend: ProfilerBackend::System,
            query_timeout_ms: 2000,
            mock_devices: vec![MockDeviceConfig {
                device: DeviceRef::cuda(0),
                total_vram_gb: 12.0,
                compute_tier: Some(ComputeTier::Ampere),
            }],
            mock_ram_gb: 32.0,
        }
    }
}

/// A device exposed by the mock profiling backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDeviceConfig {
    pub device: DeviceRef,
    pub total_vram_gb: f64,
    pub compute_tier: Option<ComputeTier>,
}

/// Per-model-type slot settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSlotConfig {
    /// Device the model type runs on
    pub device: Option<DeviceRef>,

    /// Start with the slot pinned against eviction
    pub prevent_unload: bool,

    /// Catalog model id to use; the first catalog entry of the type otherwise
    pub model_id: Option<String>,
}

/// A catalog entry: one model checkpoint and its loadable variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntryConfig {
    pub model_type: ModelType,
    pub model_id: String,
    pub variants: Vec<Variant>,
}

impl CatalogEntryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(crate::Error::config(format!(
                "Catalog entry for {} has an empty model id",
                self.model_type
            )));
        }
        if self.variants.is_empty() {
            return Err(crate::Error::config(format!(
                "Catalog entry {} has no variants",
                self.model_id
            )));
        }
        for variant in &self.variants {
            if variant.vram_gb < 0.0 || variant.ram_gb < 0.0 {
                return Err(crate::Error::config(format!(
                    "Variant {} of {} has a negative memory cost",
                    variant.precision, self.model_id
                )));
            }
        }
        Ok(())
    }

    /// Built-in catalog covering the four standard workloads
    pub fn builtin() -> Vec<Self> {
        vec![
            Self {
                model_type: ModelType::Llm,
                model_id: "llama-3.1-8b-instruct".to_string(),
                variants: vec![
                    Variant::accelerator(Precision::Bf16, 16.5, 2.0)
                        .with_min_compute_tier(ComputeTier::Ampere),
                    Variant::accelerator(Precision::Fp16, 16.5, 2.0),
                    Variant::accelerator(Precision::Int8, 9.0, 1.5)
                        .with_min_compute_tier(ComputeTier::TensorCore),
                    Variant::accelerator(Precision::Int4, 5.5, 1.0)
                        .with_min_compute_tier(ComputeTier::TensorCore),
                    Variant::cpu_offload(Precision::Int4, 6.0),
                ],
            },
            Self {
                model_type: ModelType::ImageGen,
                model_id: "sdxl-base-1.0".to_string(),
                variants: vec![
                    Variant::accelerator(Precision::Fp32, 13.0, 3.0),
                    Variant::accelerator(Precision::Fp16, 8.0, 2.0)
                        .with_min_compute_tier(ComputeTier::TensorCore),
                    Variant::cpu_offload(Precision::Fp32, 14.0),
                ],
            },
            Self {
                model_type: ModelType::Tts,
                model_id: "xtts-v2".to_string(),
                variants: vec![
                    Variant::accelerator(Precision::Fp32, 3.5, 1.0),
                    Variant::accelerator(Precision::Fp16, 2.0, 1.0),
                    Variant::cpu_offload(Precision::Fp32, 4.0),
                ],
            },
            Self {
                model_type: ModelType::Stt,
                model_id: "whisper-large-v3".to_string(),
                variants: vec![
                    Variant::accelerator(Precision::Fp16, 3.2, 0.8),
                    Variant::accelerator(Precision::Int8, 1.8, 0.8)
                        .with_min_compute_tier(ComputeTier::TensorCore),
                    Variant::cpu_offload(Precision::Fp32, 6.5),
                ],
            },
        ]
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json or text)
    pub format: String,

    /// Include the event target in log lines
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: false,
        }
    }
}
