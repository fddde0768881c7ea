//! Eviction planning
//!
//! Victims are chosen least-recently-used first. Among equally recent
//! candidates the one freeing more memory goes first, and the model type
//! ordering breaks any remaining tie, so the same starting state always
//! yields the same plan.

use crate::quantization::{QuantizationStrategy, Selection};
use crate::registry::CatalogEntry;
use mrm_core::{ComputeTier, DeviceRef, ModelType, Precision, Shortfall, Variant};
use std::cmp::Ordering;

/// A resident, evictable model and what unloading it would free
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub model_type: ModelType,
    pub device: DeviceRef,
    pub vram_gb: f64,
    pub ram_gb: f64,
    pub use_seq: u64,
}

impl EvictionCandidate {
    /// VRAM freed on `device`; models on other devices only free host RAM
    pub fn frees_vram_on(&self, device: &DeviceRef) -> f64 {
        if &self.device == device {
            self.vram_gb
        } else {
            0.0
        }
    }
}

/// Models to unload, in order, and the variant expected to fit afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPlan {
    pub victims: Vec<EvictionCandidate>,
    pub projected: Variant,
}

impl EvictionPlan {
    pub fn victim_types(&self) -> Vec<ModelType> {
        self.victims.iter().map(|c| c.model_type.clone()).collect()
    }
}

fn eviction_order(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.use_seq
        .cmp(&b.use_seq)
        .then_with(|| b.vram_gb.total_cmp(&a.vram_gb))
        .then_with(|| b.ram_gb.total_cmp(&a.ram_gb))
        .then_with(|| a.model_type.cmp(&b.model_type))
}

/// Sort candidates into eviction order
pub fn order_candidates(candidates: &mut [EvictionCandidate]) {
    candidates.sort_by(eviction_order);
}

/// What the pending activation needs to fit
#[derive(Debug, Clone, Copy)]
pub struct Headroom {
    pub vram_gb: f64,
    pub ram_gb: f64,
    pub tier: Option<ComputeTier>,
    pub max_precision: Option<Precision>,
}

/// Plan the shortest LRU prefix of victims that lets some variant fit.
///
/// Candidates that would free nothing in a dimension that is still short are
/// skipped. Returns the residual shortfall if evicting every useful
/// candidate is still not enough; in that case nothing should be unloaded.
pub fn plan(
    strategy: &QuantizationStrategy,
    entry: &CatalogEntry,
    headroom: Headroom,
    mut candidates: Vec<EvictionCandidate>,
) -> std::result::Result<EvictionPlan, Shortfall> {
    order_candidates(&mut candidates);

    let device = &entry.pinned_device;
    let mut vram_gb = headroom.vram_gb;
    let mut ram_gb = headroom.ram_gb;
    let mut victims = Vec::new();

    let select = |vram_gb: f64, ram_gb: f64| {
        strategy.select_variant(entry, vram_gb, ram_gb, headroom.tier, headroom.max_precision)
    };

    let mut shortfall = match select(vram_gb, ram_gb) {
        Selection::Fits(variant) => {
            return Ok(EvictionPlan {
                victims,
                projected: variant,
            })
        }
        Selection::Infeasible(shortfall) => shortfall,
        Selection::Unsupported => return Err(Shortfall::default()),
    };

    for candidate in candidates {
        let freed_vram = candidate.frees_vram_on(device);
        let useful = (shortfall.vram_gb > 0.0 && freed_vram > 0.0)
            || (shortfall.ram_gb > 0.0 && candidate.ram_gb > 0.0);
        if !useful {
            continue;
        }

        vram_gb += freed_vram;
        ram_gb += candidate.ram_gb;
        victims.push(candidate);

        match select(vram_gb, ram_gb) {
            Selection::Fits(variant) => {
                return Ok(EvictionPlan {
                    victims,
                    projected: variant,
                })
            }
            Selection::Infeasible(remaining) => shortfall = remaining,
            Selection::Unsupported => return Err(shortfall),
        }
    }

    Err(shortfall)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(model_type: ModelType, vram_gb: f64, use_seq: u64) -> EvictionCandidate {
        EvictionCandidate {
            model_type,
            device: DeviceRef::cuda(0),
            vram_gb,
            ram_gb: 0.5,
            use_seq,
        }
    }

    fn image_entry() -> CatalogEntry {
        CatalogEntry::new(
            ModelType::ImageGen,
            "sdxl",
            vec![Variant::accelerator(Precision::Fp16, 8.0, 2.0)],
            DeviceRef::cuda(0),
        )
    }

    fn headroom(vram_gb: f64) -> Headroom {
        Headroom {
            vram_gb,
            ram_gb: 32.0,
            tier: Some(ComputeTier::Ampere),
            max_precision: None,
        }
    }

    #[test]
    fn test_lru_order_with_tie_breaks() {
        let mut candidates = vec![
            candidate(ModelType::Stt, 2.0, 3),
            candidate(ModelType::Tts, 2.0, 1),
            candidate(ModelType::Llm, 4.0, 3),
            candidate(ModelType::ImageGen, 2.0, 3),
        ];
        order_candidates(&mut candidates);

        let order: Vec<ModelType> = candidates.into_iter().map(|c| c.model_type).collect();
        assert_eq!(
            order,
            vec![ModelType::Tts, ModelType::Llm, ModelType::ImageGen, ModelType::Stt]
        );
    }

    #[test]
    fn test_plan_evicts_lru_prefix() {
        let strategy = QuantizationStrategy::new();
        let plan = plan(
            &strategy,
            &image_entry(),
            headroom(5.0),
            vec![candidate(ModelType::Llm, 4.0, 2), candidate(ModelType::Tts, 2.0, 1)],
        )
        .unwrap();

        assert_eq!(plan.victim_types(), vec![ModelType::Tts, ModelType::Llm]);
        assert_eq!(plan.projected.vram_gb, 8.0);
    }

    #[test]
    fn test_plan_stops_once_it_fits() {
        let strategy = QuantizationStrategy::new();
        let plan = plan(
            &strategy,
            &image_entry(),
            headroom(5.0),
            vec![
                candidate(ModelType::Llm, 4.0, 1),
                candidate(ModelType::Tts, 2.0, 2),
                candidate(ModelType::Stt, 2.0, 3),
            ],
        )
        .unwrap();

        assert_eq!(plan.victim_types(), vec![ModelType::Llm]);
    }

    #[test]
    fn test_plan_reports_residual_shortfall() {
        let strategy = QuantizationStrategy::new();
        let shortfall = plan(
            &strategy,
            &image_entry(),
            headroom(5.0),
            vec![candidate(ModelType::Tts, 2.0, 1)],
        )
        .unwrap_err();

        assert_eq!(shortfall, Shortfall::new(1.0, 0.0));
    }

    #[test]
    fn test_plan_skips_other_devices_for_vram() {
        let strategy = QuantizationStrategy::new();
        let mut remote = candidate(ModelType::Stt, 6.0, 0);
        remote.device = DeviceRef::cuda(1);

        let plan = plan(
            &strategy,
            &image_entry(),
            headroom(5.0),
            vec![remote, candidate(ModelType::Llm, 4.0, 2)],
        )
        .unwrap();

        assert_eq!(plan.victim_types(), vec![ModelType::Llm]);
    }

    #[test]
    fn test_plan_without_candidates() {
        let strategy = QuantizationStrategy::new();
        let fitting = plan(&strategy, &image_entry(), headroom(9.0), Vec::new()).unwrap();
        assert!(fitting.victims.is_empty());

        let shortfall = plan(&strategy, &image_entry(), headroom(0.0), Vec::new()).unwrap_err();
        assert_eq!(shortfall, Shortfall::new(8.0, 0.0));
    }
}
