//! Core type definitions for the model resource manager

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of workload a model slot serves.
///
/// The manager keeps exactly one slot per model type. The derived ordering
/// (declaration order, then name for `Other`) is the last-resort eviction
/// tie-break, so it must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelType {
    /// Conversational text generator
    Llm,
    /// Image generator
    ImageGen,
    /// Speech synthesizer
    Tts,
    /// Speech recognizer
    Stt,
    /// Any other workload registered by name
    Other(String),
}

impl ModelType {
    /// The built-in model types
    pub fn builtin() -> [ModelType; 4] {
        [ModelType::Llm, ModelType::ImageGen, ModelType::Tts, ModelType::Stt]
    }

    /// Get the string representation of the model type
    pub fn as_str(&self) -> &str {
        match self {
            ModelType::Llm => "llm",
            ModelType::ImageGen => "image_gen",
            ModelType::Tts => "tts",
            ModelType::Stt => "stt",
            ModelType::Other(name) => name,
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err("Model type cannot be empty".to_string()),
            "llm" | "text" => Ok(ModelType::Llm),
            "image_gen" | "imagegen" | "image" => Ok(ModelType::ImageGen),
            "tts" => Ok(ModelType::Tts),
            "stt" => Ok(ModelType::Stt),
            _ => Ok(ModelType::Other(normalized)),
        }
    }
}

impl TryFrom<String> for ModelType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelType> for String {
    fn from(model_type: ModelType) -> Self {
        model_type.as_str().to_string()
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle for a compute device.
///
/// The allocator and manager only compare and hash device refs; samplers are
/// the only components that interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    /// Create a new DeviceRef from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Accelerator with the given ordinal
    pub fn cuda(index: u32) -> Self {
        Self(format!("cuda:{}", index))
    }

    /// Host-only device (no accelerator)
    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    /// Get the string representation of the DeviceRef
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accelerator ordinal, if this ref names one (`cuda:N` or `gpu:N`)
    pub fn accelerator_index(&self) -> Option<u32> {
        let (prefix, index) = self.0.split_once(':')?;
        match prefix {
            "cuda" | "gpu" => index.parse().ok(),
            _ => None,
        }
    }
}

impl Default for DeviceRef {
    fn default() -> Self {
        Self::cuda(0)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Numeric precision of a model variant, ordered by fidelity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Bf16,
    Fp16,
    Int8,
    Int4,
}

impl Precision {
    /// Fidelity rank (higher = closer to the original weights)
    pub fn fidelity(&self) -> u8 {
        match self {
            Precision::Fp32 => 4,
            Precision::Bf16 => 3,
            Precision::Fp16 => 2,
            Precision::Int8 => 1,
            Precision::Int4 => 0,
        }
    }
}

impl Ord for Precision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fidelity().cmp(&other.fidelity())
    }
}

impl PartialOrd for Precision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp32" | "full" | "float32" => Ok(Precision::Fp32),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "fp16" | "half" | "float16" => Ok(Precision::Fp16),
            "int8" | "8bit" => Ok(Precision::Int8),
            "int4" | "4bit" | "nf4" => Ok(Precision::Int4),
            _ => Err(format!("Unknown precision: {}", s)),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Bf16 => write!(f, "bf16"),
            Precision::Fp16 => write!(f, "fp16"),
            Precision::Int8 => write!(f, "int8"),
            Precision::Int4 => write!(f, "int4"),
        }
    }
}

/// Where a variant's weights live once loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Weights resident in accelerator memory
    #[default]
    Accelerator,
    /// Weights resident in host memory, executed with CPU offload
    CpuOffload,
}

/// Accelerator capability tier, used to gate precision/acceleration paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTier {
    /// Pre-Volta parts without tensor cores
    Legacy,
    /// Volta/Turing: fp16 tensor cores
    TensorCore,
    /// Ampere: bf16 and fast int8
    Ampere,
    /// Ada/Hopper and newer: fp8 paths
    Hopper,
}

impl ComputeTier {
    /// Map a CUDA compute capability to a tier
    pub fn from_capability(major: u32, minor: u32) -> Self {
        match (major, minor) {
            (0..=6, _) => ComputeTier::Legacy,
            (7, _) => ComputeTier::TensorCore,
            (8, 0..=8) => ComputeTier::Ampere,
            _ => ComputeTier::Hopper,
        }
    }
}

impl fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeTier::Legacy => write!(f, "legacy"),
            ComputeTier::TensorCore => write!(f, "tensor_core"),
            ComputeTier::Ampere => write!(f, "ampere"),
            ComputeTier::Hopper => write!(f, "hopper"),
        }
    }
}

/// One loadable precision form of a model with its memory cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub precision: Precision,

    #[serde(default)]
    pub placement: Placement,

    /// Accelerator memory needed, in GB
    pub vram_gb: f64,

    /// Host memory needed, in GB
    #[serde(default)]
    pub ram_gb: f64,

    /// Lowest compute tier able to run this variant
    #[serde(default)]
    pub min_compute_tier: Option<ComputeTier>,
}

impl Variant {
    /// Accelerator-resident variant
    pub fn accelerator(precision: Precision, vram_gb: f64, ram_gb: f64) -> Self {
        Self {
            precision,
            placement: Placement::Accelerator,
            vram_gb,
            ram_gb,
            min_compute_tier: None,
        }
    }

    /// RAM-resident variant that needs no accelerator memory
    pub fn cpu_offload(precision: Precision, ram_gb: f64) -> Self {
        Self {
            precision,
            placement: Placement::CpuOffload,
            vram_gb: 0.0,
            ram_gb,
            min_compute_tier: None,
        }
    }

    pub fn with_min_compute_tier(mut self, tier: ComputeTier) -> Self {
        self.min_compute_tier = Some(tier);
        self
    }

    pub fn is_offload(&self) -> bool {
        self.placement == Placement::CpuOffload
    }

    /// Whether a device of the given tier can run this variant.
    /// A missing tier (no accelerator) only satisfies variants with no requirement.
    pub fn supported_on(&self, tier: Option<ComputeTier>) -> bool {
        match (self.min_compute_tier, tier) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(required), Some(available)) => available >= required,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.placement {
            Placement::Accelerator => write!(f, "{} ({:.1} GB VRAM)", self.precision, self.vram_gb),
            Placement::CpuOffload => write!(f, "{} offload ({:.1} GB RAM)", self.precision, self.ram_gb),
        }
    }
}

/// Memory that is missing for a request to fit
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Shortfall {
    pub vram_gb: f64,
    pub ram_gb: f64,
}

impl Shortfall {
    pub fn new(vram_gb: f64, ram_gb: f64) -> Self {
        Self {
            vram_gb: vram_gb.max(0.0),
            ram_gb: ram_gb.max(0.0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.vram_gb <= 0.0 && self.ram_gb <= 0.0
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} GB VRAM, {:.2} GB RAM", self.vram_gb, self.ram_gb)
    }
}
