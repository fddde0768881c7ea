//! Best-fit variant selection

use crate::registry::CatalogEntry;
use crate::EPSILON_GB;
use mrm_core::{ComputeTier, Precision, Shortfall, Variant};

/// Result of a fit check
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Highest-fidelity variant that fits the headroom
    Fits(Variant),

    /// Nothing fits; the smallest amount that would have to be freed
    Infeasible(Shortfall),

    /// Every variant is excluded by compute tier or precision cap
    Unsupported,
}

/// Picks the variant of a catalog entry to load for the current headroom.
///
/// Pure: the same inputs always produce the same selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizationStrategy;

impl QuantizationStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Select the highest-fidelity variant that fits.
    ///
    /// Accelerator variants are tried first, in catalog order. A CPU-offload
    /// variant is only chosen when no accelerator variant fits. `tier` of
    /// `None` means the device has no accelerator, so only offload variants
    /// are eligible. `max_precision` caps fidelity for callers that asked for
    /// a specific variant.
    pub fn select_variant(
        &self,
        entry: &CatalogEntry,
        available_vram_gb: f64,
        available_ram_gb: f64,
        tier: Option<ComputeTier>,
        max_precision: Option<Precision>,
    ) -> Selection {
        let eligible: Vec<&Variant> = entry
            .variants
            .iter()
            .filter(|v| v.supported_on(tier))
            .filter(|v| v.is_offload() || tier.is_some())
            .filter(|v| max_precision.map_or(true, |cap| v.precision <= cap))
            .collect();

        if eligible.is_empty() {
            return Selection::Unsupported;
        }

        let (offload, accelerated): (Vec<&Variant>, Vec<&Variant>) =
            eligible.into_iter().partition(|v| v.is_offload());

        let fits = |v: &Variant| {
            v.vram_gb <= available_vram_gb + EPSILON_GB && v.ram_gb <= available_ram_gb + EPSILON_GB
        };

        if let Some(variant) = accelerated.iter().find(|v| fits(v)) {
            return Selection::Fits((*variant).clone());
        }
        if let Some(variant) = offload.iter().find(|v| fits(v)) {
            return Selection::Fits((*variant).clone());
        }

        // Report the cheapest way out so eviction knows how much to free
        let pool = if accelerated.is_empty() { &offload } else { &accelerated };
        let shortfall = pool
            .iter()
            .map(|v| Shortfall::new(v.vram_gb - available_vram_gb, v.ram_gb - available_ram_gb))
            .min_by(|a, b| a.vram_gb.total_cmp(&b.vram_gb).then_with(|| a.ram_gb.total_cmp(&b.ram_gb)))
            .unwrap_or_default();

        Selection::Infeasible(shortfall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrm_core::{DeviceRef, ModelType};

    fn llm_entry() -> CatalogEntry {
        CatalogEntry::new(
            ModelType::Llm,
            "llama",
            vec![
                Variant::accelerator(Precision::Fp16, 16.0, 2.0),
                Variant::accelerator(Precision::Int8, 9.0, 1.5)
                    .with_min_compute_tier(ComputeTier::TensorCore),
                Variant::accelerator(Precision::Int4, 5.0, 1.0)
                    .with_min_compute_tier(ComputeTier::TensorCore),
                Variant::cpu_offload(Precision::Int4, 6.0),
            ],
            DeviceRef::cuda(0),
        )
    }

    fn fitted(selection: &Selection) -> &Variant {
        match selection {
            Selection::Fits(variant) => variant,
            other => panic!("expected a fitting variant, got {:?}", other),
        }
    }

    #[test]
    fn test_selects_highest_fidelity_that_fits() {
        let strategy = QuantizationStrategy::new();
        let entry = llm_entry();

        let selection = strategy.select_variant(&entry, 24.0, 32.0, Some(ComputeTier::Ampere), None);
        assert_eq!(fitted(&selection).precision, Precision::Fp16);

        let selection = strategy.select_variant(&entry, 10.0, 32.0, Some(ComputeTier::Ampere), None);
        assert_eq!(fitted(&selection).precision, Precision::Int8);

        // Exactly at the boundary still fits
        let selection = strategy.select_variant(&entry, 5.0, 1.0, Some(ComputeTier::Ampere), None);
        assert_eq!(fitted(&selection).precision, Precision::Int4);
        assert!(!fitted(&selection).is_offload());
    }

    #[test]
    fn test_compute_tier_gating() {
        let strategy = QuantizationStrategy::new();
        let entry = llm_entry();

        // Legacy parts cannot run the quantized kernels, so fall back to offload
        let selection = strategy.select_variant(&entry, 10.0, 32.0, Some(ComputeTier::Legacy), None);
        let variant = fitted(&selection);
        assert!(variant.is_offload());
        assert_eq!(variant.precision, Precision::Int4);
    }

    #[test]
    fn test_offload_fallback_without_accelerator() {
        let strategy = QuantizationStrategy::new();
        let entry = llm_entry();

        let selection = strategy.select_variant(&entry, 0.0, 8.0, None, None);
        assert!(fitted(&selection).is_offload());

        let selection = strategy.select_variant(&entry, 0.0, 4.0, None, None);
        assert_eq!(selection, Selection::Infeasible(Shortfall::new(0.0, 2.0)));
    }

    #[test]
    fn test_infeasible_reports_smallest_shortfall() {
        let strategy = QuantizationStrategy::new();
        let entry = CatalogEntry::new(
            ModelType::ImageGen,
            "sdxl",
            vec![
                Variant::accelerator(Precision::Fp32, 13.0, 3.0),
                Variant::accelerator(Precision::Fp16, 8.0, 2.0),
            ],
            DeviceRef::cuda(0),
        );

        let selection = strategy.select_variant(&entry, 7.0, 16.0, Some(ComputeTier::Ampere), None);
        assert_eq!(selection, Selection::Infeasible(Shortfall::new(1.0, 0.0)));
    }

    #[test]
    fn test_precision_cap() {
        let strategy = QuantizationStrategy::new();
        let entry = llm_entry();

        let selection = strategy.select_variant(
            &entry,
            24.0,
            32.0,
            Some(ComputeTier::Ampere),
            Some(Precision::Int8),
        );
        assert_eq!(fitted(&selection).precision, Precision::Int8);
    }

    #[test]
    fn test_unsupported_when_everything_gated() {
        let strategy = QuantizationStrategy::new();
        let entry = CatalogEntry::new(
            ModelType::Llm,
            "llama",
            vec![Variant::accelerator(Precision::Bf16, 8.0, 1.0).with_min_compute_tier(ComputeTier::Ampere)],
            DeviceRef::cuda(0),
        );

        let selection = strategy.select_variant(&entry, 24.0, 32.0, Some(ComputeTier::TensorCore), None);
        assert_eq!(selection, Selection::Unsupported);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let strategy = QuantizationStrategy::new();
        let entry = llm_entry();
        let first = strategy.select_variant(&entry, 9.5, 3.0, Some(ComputeTier::Hopper), None);
        for _ in 0..10 {
            assert_eq!(
                strategy.select_variant(&entry, 9.5, 3.0, Some(ComputeTier::Hopper), None),
                first
            );
        }
    }
}
