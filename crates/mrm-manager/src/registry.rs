//! Static catalog of models, their variants and device pins

use crate::{ResourceError, Result};
use mrm_core::{Config, DeviceRef, ModelType, Variant};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// The selected model for one model type
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub model_type: ModelType,
    pub model_id: String,

    /// Variants ordered from highest fidelity (most memory) to lowest
    pub variants: Vec<Variant>,

    /// Device this model type runs on
    pub pinned_device: DeviceRef,
}

impl CatalogEntry {
    pub fn new(
        model_type: ModelType,
        model_id: impl Into<String>,
        mut variants: Vec<Variant>,
        pinned_device: DeviceRef,
    ) -> Self {
        variants.sort_by(fidelity_order);
        Self {
            model_type,
            model_id: model_id.into(),
            variants,
            pinned_device,
        }
    }

    /// Smallest VRAM cost among accelerator variants
    pub fn min_vram_gb(&self) -> Option<f64> {
        self.variants
            .iter()
            .filter(|v| !v.is_offload())
            .map(|v| v.vram_gb)
            .min_by(f64::total_cmp)
    }
}

/// Highest precision first, then larger footprint, then accelerator before offload
fn fidelity_order(a: &Variant, b: &Variant) -> Ordering {
    b.precision
        .cmp(&a.precision)
        .then_with(|| b.vram_gb.total_cmp(&a.vram_gb))
        .then_with(|| a.is_offload().cmp(&b.is_offload()))
        .then_with(|| b.ram_gb.total_cmp(&a.ram_gb))
}

/// Read-only catalog consulted on every admission decision.
///
/// Built once at startup; device pinning is an explicit per-type setting
/// and falls back to the shared default device.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    default_device: DeviceRef,
    entries: BTreeMap<ModelType, CatalogEntry>,
}

impl ModelRegistry {
    /// Create an empty registry whose unpinned types use `default_device`
    pub fn new(default_device: DeviceRef) -> Self {
        Self {
            default_device,
            entries: BTreeMap::new(),
        }
    }

    /// Build the registry from configuration, selecting one model per type
    pub fn from_config(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ResourceError::Configuration(e.to_string()))?;

        let mut registry = Self::new(config.default_device.clone());
        for entry in &config.catalog {
            if registry.entries.contains_key(&entry.model_type) {
                continue;
            }
            let selected = config
                .models
                .get(&entry.model_type)
                .and_then(|slot| slot.model_id.as_deref());

            let chosen = match selected {
                Some(model_id) => config
                    .catalog
                    .iter()
                    .find(|e| e.model_type == entry.model_type && e.model_id == model_id)
                    .unwrap_or(entry),
                None => entry,
            };

            let device = config.device_for(&chosen.model_type);
            debug!(
                model_type = %chosen.model_type,
                model_id = %chosen.model_id,
                device = %device,
                "Registered catalog entry"
            );
            registry.entries.insert(
                chosen.model_type.clone(),
                CatalogEntry::new(
                    chosen.model_type.clone(),
                    chosen.model_id.clone(),
                    chosen.variants.clone(),
                    device,
                ),
            );
        }

        Ok(registry)
    }

    /// Register a model on the default device
    pub fn with_entry(
        mut self,
        model_type: ModelType,
        model_id: impl Into<String>,
        variants: Vec<Variant>,
    ) -> Self {
        let device = self.default_device.clone();
        self.entries.insert(
            model_type.clone(),
            CatalogEntry::new(model_type, model_id, variants, device),
        );
        self
    }

    /// Pin an already registered model type to a device
    pub fn with_device(mut self, model_type: &ModelType, device: DeviceRef) -> Self {
        if let Some(entry) = self.entries.get_mut(model_type) {
            entry.pinned_device = device;
        }
        self
    }

    /// Look up the selected catalog entry for a model type
    pub fn lookup(&self, model_type: &ModelType) -> Result<&CatalogEntry> {
        self.entries
            .get(model_type)
            .ok_or_else(|| ResourceError::UnknownModelType(model_type.clone()))
    }

    /// Registered model types in stable order
    pub fn model_types(&self) -> impl Iterator<Item = &ModelType> {
        self.entries.keys()
    }

    /// Every device some model type is pinned to
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.entries
            .values()
            .map(|entry| entry.pinned_device.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn default_device(&self) -> &DeviceRef {
        &self.default_device
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrm_core::{CatalogEntryConfig, ModelSlotConfig, Precision};

    #[test]
    fn test_variants_sorted_by_fidelity() {
        let entry = CatalogEntry::new(
            ModelType::Llm,
            "llama",
            vec![
                Variant::accelerator(Precision::Int4, 4.0, 1.0),
                Variant::cpu_offload(Precision::Fp16, 16.0),
                Variant::accelerator(Precision::Fp16, 16.0, 1.0),
                Variant::accelerator(Precision::Int8, 8.0, 1.0),
            ],
            DeviceRef::cuda(0),
        );

        let order: Vec<(Precision, bool)> = entry
            .variants
            .iter()
            .map(|v| (v.precision, v.is_offload()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Precision::Fp16, false),
                (Precision::Fp16, true),
                (Precision::Int8, false),
                (Precision::Int4, false),
            ]
        );
        assert_eq!(entry.min_vram_gb(), Some(4.0));
    }

    #[test]
    fn test_lookup_unknown_type() {
        let registry = ModelRegistry::new(DeviceRef::cuda(0));
        let err = registry.lookup(&ModelType::Stt).unwrap_err();
        assert!(matches!(err, ResourceError::UnknownModelType(ModelType::Stt)));
    }

    #[test]
    fn test_from_config_uses_device_pins() {
        let mut config = Config::default();
        config.models.insert(
            ModelType::Stt,
            ModelSlotConfig {
                device: Some(DeviceRef::cuda(1)),
                ..Default::default()
            },
        );

        let registry = ModelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.lookup(&ModelType::Stt).unwrap().pinned_device,
            DeviceRef::cuda(1)
        );
        assert_eq!(
            registry.lookup(&ModelType::ImageGen).unwrap().pinned_device,
            DeviceRef::cuda(0)
        );
        assert_eq!(registry.devices(), vec![DeviceRef::cuda(0), DeviceRef::cuda(1)]);
    }

    #[test]
    fn test_from_config_selects_model_id() {
        let mut config = Config::default();
        config.catalog.push(CatalogEntryConfig {
            model_type: ModelType::Llm,
            model_id: "qwen2.5-3b".to_string(),
            variants: vec![Variant::accelerator(Precision::Fp16, 6.5, 1.0)],
        });
        config.models.insert(
            ModelType::Llm,
            ModelSlotConfig {
                model_id: Some("qwen2.5-3b".to_string()),
                ..Default::default()
            },
        );

        let registry = ModelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.lookup(&ModelType::Llm).unwrap().model_id, "qwen2.5-3b");
    }

    #[test]
    fn test_with_device_pins_entry() {
        let registry = ModelRegistry::new(DeviceRef::cuda(0))
            .with_entry(ModelType::ImageGen, "sdxl", vec![Variant::accelerator(Precision::Fp16, 8.0, 2.0)])
            .with_device(&ModelType::ImageGen, DeviceRef::cuda(1));
        assert_eq!(
            registry.lookup(&ModelType::ImageGen).unwrap().pinned_device,
            DeviceRef::cuda(1)
        );
        assert_eq!(registry.default_device(), &DeviceRef::cuda(0));
    }
}
