//! Model lifecycle orchestration
//!
//! One slot exists per registered model type. A slot moves through
//! `Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`, with `Busy` as
//! a sub-state of `Loaded` while jobs run. Slot claims happen synchronously
//! under the slot's map entry; loader and unloader calls run in spawned tasks
//! so that dropping a caller's future never interrupts them.

use crate::allocator::{Commitment, MemoryAllocator};
use crate::eviction::{self, EvictionCandidate, Headroom};
use crate::quantization::{QuantizationStrategy, Selection};
use crate::registry::{CatalogEntry, ModelRegistry};
use crate::{ResourceError, Result, EPSILON_GB};

use dashmap::DashMap;
use mrm_adapter_hw::{HardwareProfile, HardwareProfiler};
use mrm_core::{
    ActiveModelInfo, ComputeTier, Config, DeviceRef, LoadRequest, MemoryAllocationBreakdown, MemoryConfig,
    ModelLoader, ModelState, ModelType, Precision, ProfilerConfig, Variant,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-call activation options
#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    /// Highest precision the caller wants; a resident variant of another
    /// precision is reloaded
    pub variant_hint: Option<Precision>,

    /// Cancels the activation up to the moment the loader is invoked
    pub cancel: Option<CancellationToken>,
}

impl ActivateOptions {
    pub fn with_hint(mut self, precision: Precision) -> Self {
        self.variant_hint = Some(precision);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |token| token.is_cancelled())
    }
}

/// Result of a successful activation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationOutcome {
    pub model_type: ModelType,
    pub state: ModelState,
    pub active_variant: Variant,
    pub vram_allocated_gb: f64,
    pub ram_allocated_gb: f64,

    /// Models unloaded to make room, in eviction order
    pub evicted: Vec<ModelType>,

    /// The slot was already resident with an acceptable variant
    pub already_active: bool,
}

/// Point-in-time view of every slot and every device in use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub models: BTreeMap<ModelType, ActiveModelInfo>,
    pub breakdowns: BTreeMap<DeviceRef, MemoryAllocationBreakdown>,
}

struct Slot {
    info: ActiveModelInfo,
    commitment: Option<Commitment>,
    loader: Arc<dyn ModelLoader>,
}

enum Claim {
    Active(ActivationOutcome),
    Load,
    Reload(Option<Commitment>),
}

/// Builder for [`ModelResourceManager`]
pub struct ManagerBuilder {
    registry: ModelRegistry,
    profiler: Option<HardwareProfiler>,
    allocator: Option<MemoryAllocator>,
    loaders: HashMap<ModelType, Arc<dyn ModelLoader>>,
    shared_loader: Option<Arc<dyn ModelLoader>>,
    pins: HashMap<ModelType, bool>,
}

impl ManagerBuilder {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            profiler: None,
            allocator: None,
            loaders: HashMap::new(),
            shared_loader: None,
            pins: HashMap::new(),
        }
    }

    /// Start from configuration: catalog, device pins, memory floors,
    /// profiler backend and initial pin state. Loaders still have to be added.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = ModelRegistry::from_config(config)?;
        let pins = registry
            .model_types()
            .map(|model_type| (model_type.clone(), config.prevent_unload(model_type)))
            .collect();

        Ok(Self {
            profiler: Some(HardwareProfiler::from_config(&config.profiler)),
            allocator: Some(MemoryAllocator::new(config.memory.clone())),
            pins,
            ..Self::new(registry)
        })
    }

    pub fn profiler(mut self, profiler: HardwareProfiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn allocator(mut self, allocator: MemoryAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Loader for one model type
    pub fn loader(mut self, model_type: ModelType, loader: Arc<dyn ModelLoader>) -> Self {
        self.loaders.insert(model_type, loader);
        self
    }

    /// Loader used by every model type without a dedicated one
    pub fn shared_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.shared_loader = Some(loader);
        self
    }

    /// Initial pin state of a slot
    pub fn pinned(mut self, model_type: ModelType, pinned: bool) -> Self {
        self.pins.insert(model_type, pinned);
        self
    }

    pub fn build(self) -> Result<ModelResourceManager> {
        if self.registry.is_empty() {
            return Err(ResourceError::Configuration(
                "Registry contains no model types".to_string(),
            ));
        }

        let slots = DashMap::new();
        for model_type in self.registry.model_types() {
            let entry = self.registry.lookup(model_type)?;
            let loader = self
                .loaders
                .get(model_type)
                .or(self.shared_loader.as_ref())
                .cloned()
                .ok_or_else(|| {
                    ResourceError::Configuration(format!("No loader registered for {}", model_type))
                })?;

            let mut info = ActiveModelInfo::new(
                model_type.clone(),
                entry.model_id.clone(),
                entry.pinned_device.clone(),
            );
            info.pinned = self.pins.get(model_type).copied().unwrap_or(false);

            slots.insert(
                model_type.clone(),
                Slot {
                    info,
                    commitment: None,
                    loader,
                },
            );
        }

        info!(
            "Model resource manager ready with {} model types on {} device(s)",
            self.registry.len(),
            self.registry.devices().len()
        );

        Ok(ModelResourceManager {
            inner: Arc::new(ManagerInner {
                strategy: QuantizationStrategy::new(),
                allocator: self
                    .allocator
                    .unwrap_or_else(|| MemoryAllocator::new(MemoryConfig::default())),
                profiler: self
                    .profiler
                    .unwrap_or_else(|| HardwareProfiler::from_config(&ProfilerConfig::default())),
                registry: self.registry,
                slots,
                clock: AtomicU64::new(0),
            }),
        })
    }
}

/// Orchestrates activation, eviction and deactivation of model slots.
///
/// Cheap to clone; clones share the same slots and ledger.
#[derive(Clone)]
pub struct ModelResourceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: ModelRegistry,
    strategy: QuantizationStrategy,
    allocator: MemoryAllocator,
    profiler: HardwareProfiler,
    slots: DashMap<ModelType, Slot>,
    clock: AtomicU64,
}

impl ModelResourceManager {
    pub fn builder(registry: ModelRegistry) -> ManagerBuilder {
        ManagerBuilder::new(registry)
    }

    /// Activate a model type with default options
    pub async fn activate(&self, model_type: ModelType) -> Result<ActivationOutcome> {
        self.activate_with(model_type, ActivateOptions::default()).await
    }

    /// Make a model type resident, evicting least-recently-used models if needed
    pub async fn activate_with(
        &self,
        model_type: ModelType,
        options: ActivateOptions,
    ) -> Result<ActivationOutcome> {
        let entry = self.inner.registry.lookup(&model_type)?.clone();

        let claim = self.inner.with_slot(&model_type, |slot| {
            let state = slot.info.state;
            match state {
                ModelState::Loaded | ModelState::Busy => {
                    if let Some(active) = slot.info.active_variant.clone() {
                        if options.variant_hint.map_or(true, |hint| hint == active.precision) {
                            slot.info.touch(self.inner.next_seq());
                            return Ok(Claim::Active(ActivationOutcome {
                                model_type: model_type.clone(),
                                state,
                                active_variant: active,
                                vram_allocated_gb: slot.info.vram_allocated_gb,
                                ram_allocated_gb: slot.info.ram_allocated_gb,
                                evicted: Vec::new(),
                                already_active: true,
                            }));
                        }
                    }
                    if state == ModelState::Busy {
                        return Err(ResourceError::InvalidState {
                            model_type: model_type.clone(),
                            state,
                            operation: "reload",
                        });
                    }
                    slot.info.state = ModelState::Unloading;
                    Ok(Claim::Reload(slot.commitment.take()))
                }
                ModelState::Loading | ModelState::Unloading => Err(ResourceError::AlreadyInTransition {
                    model_type: model_type.clone(),
                    state,
                }),
                ModelState::Unloaded => {
                    slot.info.state = ModelState::Loading;
                    Ok(Claim::Load)
                }
            }
        })??;

        if let Claim::Active(outcome) = claim {
            debug!(model_type = %model_type, "Model already active");
            return Ok(outcome);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_activation(entry, options, claim).await })
            .await
            .map_err(|e| ResourceError::Internal(format!("activation task failed: {}", e)))?
    }

    /// Unload a resident, idle model type
    pub async fn deactivate(&self, model_type: ModelType) -> Result<()> {
        let commitment = self.inner.with_slot(&model_type, |slot| {
            let state = slot.info.state;
            match state {
                ModelState::Loaded => {
                    slot.info.state = ModelState::Unloading;
                    Ok(slot.commitment.take())
                }
                ModelState::Busy | ModelState::Unloaded => Err(ResourceError::InvalidState {
                    model_type: model_type.clone(),
                    state,
                    operation: "deactivate",
                }),
                ModelState::Loading | ModelState::Unloading => Err(ResourceError::AlreadyInTransition {
                    model_type: model_type.clone(),
                    state,
                }),
            }
        })??;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .unload_claimed(&model_type, commitment, ModelState::Unloaded)
                .await
        })
        .await
        .map_err(|e| ResourceError::Internal(format!("deactivation task failed: {}", e)))?
    }

    /// A job started on the model; it cannot be evicted until idle again
    pub fn mark_busy(&self, model_type: &ModelType) -> Result<ModelState> {
        let seq = self.inner.next_seq();
        self.inner.with_slot(model_type, |slot| match slot.info.state {
            ModelState::Loaded | ModelState::Busy => {
                slot.info.busy_jobs += 1;
                slot.info.state = ModelState::Busy;
                slot.info.touch(seq);
                debug!(model_type = %model_type, jobs = slot.info.busy_jobs, "Job started");
                Ok(ModelState::Busy)
            }
            state => Err(ResourceError::InvalidState {
                model_type: model_type.clone(),
                state,
                operation: "mark busy",
            }),
        })?
    }

    /// A job finished; the slot returns to `Loaded` once no jobs remain
    pub fn mark_idle(&self, model_type: &ModelType) -> Result<ModelState> {
        let seq = self.inner.next_seq();
        self.inner.with_slot(model_type, |slot| match slot.info.state {
            ModelState::Busy => {
                slot.info.busy_jobs = slot.info.busy_jobs.saturating_sub(1);
                if slot.info.busy_jobs == 0 {
                    slot.info.state = ModelState::Loaded;
                }
                slot.info.touch(seq);
                debug!(model_type = %model_type, jobs = slot.info.busy_jobs, "Job finished");
                Ok(slot.info.state)
            }
            state => Err(ResourceError::InvalidState {
                model_type: model_type.clone(),
                state,
                operation: "mark idle",
            }),
        })?
    }

    /// Pin or unpin a slot against eviction; allowed in any state
    pub fn set_pin(&self, model_type: &ModelType, pinned: bool) -> Result<()> {
        self.inner.with_slot(model_type, |slot| {
            slot.info.pinned = pinned;
        })?;
        info!(model_type = %model_type, pinned, "Pin updated");
        Ok(())
    }

    /// Record the canvas history working set held on a device
    pub fn report_canvas_history(&self, device: &DeviceRef, vram_gb: f64, ram_gb: f64) {
        self.inner.allocator.report_canvas_history(device, vram_gb, ram_gb);
    }

    /// Fresh state of one slot
    pub fn state(&self, model_type: &ModelType) -> Result<ModelState> {
        self.inner.with_slot(model_type, |slot| slot.info.state)
    }

    /// Fresh record of one slot
    pub fn info(&self, model_type: &ModelType) -> Result<ActiveModelInfo> {
        self.inner.with_slot(model_type, |slot| slot.info.clone())
    }

    /// Every slot plus a freshly profiled breakdown for each device in use
    pub async fn snapshot(&self) -> ManagerSnapshot {
        let models = self
            .inner
            .slots
            .iter()
            .map(|slot| (slot.key().clone(), slot.info.clone()))
            .collect();

        let mut breakdowns = BTreeMap::new();
        for device in self.inner.registry.devices() {
            self.inner.profile(&device).await;
            let breakdown = self.inner.allocator.snapshot(&device);
            breakdowns.insert(device, breakdown);
        }

        ManagerSnapshot { models, breakdowns }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.inner.allocator
    }
}

impl ManagerInner {
    fn next_seq(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Run `f` on a slot while holding its entry; never held across an await
    fn with_slot<R>(&self, model_type: &ModelType, f: impl FnOnce(&mut Slot) -> R) -> Result<R> {
        let mut slot = self
            .slots
            .get_mut(model_type)
            .ok_or_else(|| ResourceError::UnknownModelType(model_type.clone()))?;
        Ok(f(&mut slot))
    }

    async fn profile(&self, device: &DeviceRef) -> HardwareProfile {
        let profile = self.profiler.profile(device).await;
        self.allocator.observe(&profile);
        profile
    }

    async fn run_activation(
        self: Arc<Self>,
        entry: CatalogEntry,
        options: ActivateOptions,
        claim: Claim,
    ) -> Result<ActivationOutcome> {
        let model_type = entry.model_type.clone();

        if let Claim::Reload(commitment) = claim {
            info!(model_type = %model_type, hint = ?options.variant_hint, "Reloading with another variant");
            self.unload_claimed(&model_type, commitment, ModelState::Loading)
                .await?;
        }

        match self.admit_and_load(&entry, &options).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let record = matches!(
                    err,
                    ResourceError::LoaderFailed { .. } | ResourceError::FootprintExceeded { .. }
                );
                let message = err.to_string();
                let _ = self.with_slot(&model_type, |slot| {
                    // A failed unload after an oversize load leaves the model resident
                    if slot.info.state.is_resident() {
                        return;
                    }
                    slot.info.mark_unloaded();
                    if record {
                        slot.info.last_error = Some(message);
                    }
                });
                warn!(
                    model_type = %model_type,
                    category = err.category(),
                    "Activation failed: {}",
                    err
                );
                Err(err)
            }
        }
    }

    /// Admission, eviction and load for a slot already claimed as `Loading`.
    /// Any commitment taken here is released before an error is returned,
    /// unless the model could not be unloaded and stays resident.
    async fn admit_and_load(
        &self,
        entry: &CatalogEntry,
        options: &ActivateOptions,
    ) -> Result<ActivationOutcome> {
        let model_type = &entry.model_type;
        let device = &entry.pinned_device;

        if options.is_cancelled() {
            return Err(ResourceError::Cancelled(model_type.clone()));
        }

        let profile = self.profile(device).await;
        let tier = if profile.has_accelerator() {
            profile.compute_tier
        } else {
            None
        };
        let headroom = self.headroom(device, tier, options.variant_hint);

        let mut evicted = Vec::new();
        let variant = match self.select(entry, headroom) {
            Selection::Fits(variant) => variant,
            Selection::Unsupported => {
                return Err(ResourceError::NoEligibleVariant {
                    model_type: model_type.clone(),
                })
            }
            Selection::Infeasible(shortfall) => {
                debug!(model_type = %model_type, %shortfall, "No variant fits, planning eviction");
                evicted = self.evict_for(entry, headroom, options).await?;

                // One retry after eviction, never a second eviction round
                match self.select(entry, self.headroom(device, tier, options.variant_hint)) {
                    Selection::Fits(variant) => variant,
                    Selection::Infeasible(shortfall) => {
                        return Err(ResourceError::Infeasible {
                            model_type: model_type.clone(),
                            shortfall,
                        })
                    }
                    Selection::Unsupported => {
                        return Err(ResourceError::NoEligibleVariant {
                            model_type: model_type.clone(),
                        })
                    }
                }
            }
        };

        let mut commitment = self.allocator.reserve(device, variant.vram_gb, variant.ram_gb)?;

        if options.is_cancelled() {
            self.allocator.release(commitment);
            return Err(ResourceError::Cancelled(model_type.clone()));
        }

        let loader = self.with_slot(model_type, |slot| Arc::clone(&slot.loader))?;
        let request = LoadRequest {
            model_type: model_type.clone(),
            model_id: entry.model_id.clone(),
            device: device.clone(),
            variant: variant.clone(),
        };

        info!(
            model_type = %model_type,
            device = %device,
            vram_gb = variant.vram_gb,
            "Loading {} as {}",
            entry.model_id,
            variant
        );

        match loader.load(&request).await {
            Err(e) => {
                self.allocator.release(commitment);
                error!(
                    model_type = %model_type,
                    category = e.category(),
                    retryable = e.is_retryable(),
                    "Loader failed: {}",
                    e
                );
                return Err(ResourceError::LoaderFailed {
                    model_type: model_type.clone(),
                    message: e.to_string(),
                });
            }
            Ok(Some(footprint)) => {
                let differs = (footprint.vram_gb - commitment.vram_gb()).abs() > EPSILON_GB
                    || (footprint.ram_gb - commitment.ram_gb()).abs() > EPSILON_GB;
                if differs {
                    if let Err(rejection) =
                        self.allocator
                            .adjust(&mut commitment, footprint.vram_gb, footprint.ram_gb)
                    {
                        warn!(
                            model_type = %model_type,
                            vram_gb = footprint.vram_gb,
                            "Confirmed footprint does not fit, unloading"
                        );
                        if let Err(e) = loader.unload(model_type, &entry.model_id).await {
                            // Weights are still resident: keep the reservation and report the slot loaded
                            let message = e.to_string();
                            error!(model_type = %model_type, "Unload after oversize load failed: {}", message);
                            let seq = self.next_seq();
                            let (vram_gb, ram_gb) = (commitment.vram_gb(), commitment.ram_gb());
                            let last_error = message.clone();
                            self.with_slot(model_type, |slot| {
                                slot.info.mark_loaded(variant.clone(), vram_gb, ram_gb);
                                slot.info.touch(seq);
                                slot.info.last_error = Some(last_error);
                                slot.commitment = Some(commitment);
                            })?;
                            return Err(ResourceError::UnloaderFailed {
                                model_type: model_type.clone(),
                                message,
                            });
                        }
                        self.allocator.release(commitment);
                        return Err(ResourceError::FootprintExceeded {
                            model_type: model_type.clone(),
                            shortfall: rejection.shortfall,
                        });
                    }
                }
            }
            Ok(None) => {}
        }

        let seq = self.next_seq();
        let vram_gb = commitment.vram_gb();
        let ram_gb = commitment.ram_gb();
        self.with_slot(model_type, |slot| {
            slot.info.mark_loaded(variant.clone(), vram_gb, ram_gb);
            slot.info.touch(seq);
            slot.commitment = Some(commitment);
        })?;

        info!(
            model_type = %model_type,
            vram_gb,
            ram_gb,
            evicted = evicted.len(),
            "Model loaded"
        );

        Ok(ActivationOutcome {
            model_type: model_type.clone(),
            state: ModelState::Loaded,
            active_variant: variant,
            vram_allocated_gb: vram_gb,
            ram_allocated_gb: ram_gb,
            evicted,
            already_active: false,
        })
    }

    fn headroom(&self, device: &DeviceRef, tier: Option<ComputeTier>, hint: Option<Precision>) -> Headroom {
        let breakdown = self.allocator.snapshot(device);
        Headroom {
            vram_gb: breakdown.available_for_models_vram_gb(),
            ram_gb: breakdown.available_for_models_ram_gb(),
            tier,
            max_precision: hint,
        }
    }

    fn select(&self, entry: &CatalogEntry, headroom: Headroom) -> Selection {
        self.strategy.select_variant(
            entry,
            headroom.vram_gb,
            headroom.ram_gb,
            headroom.tier,
            headroom.max_precision,
        )
    }

    /// Plan and run one eviction round for `entry`; returns the evicted types
    async fn evict_for(
        &self,
        entry: &CatalogEntry,
        headroom: Headroom,
        options: &ActivateOptions,
    ) -> Result<Vec<ModelType>> {
        let model_type = &entry.model_type;
        let device = &entry.pinned_device;

        let mut candidates = Vec::new();
        let mut blocked = false;
        for slot in self.slots.iter() {
            let info = &slot.info;
            if &info.model_type == model_type || !info.state.is_resident() {
                continue;
            }
            let Some(commitment) = slot.commitment.as_ref() else {
                continue;
            };
            if info.can_unload() {
                candidates.push(EvictionCandidate {
                    model_type: info.model_type.clone(),
                    device: info.device.clone(),
                    vram_gb: commitment.vram_gb(),
                    ram_gb: commitment.ram_gb(),
                    use_seq: info.use_seq,
                });
            } else if &info.device == device {
                blocked = true;
            }
        }

        let no_candidates = candidates.is_empty();
        let plan = match eviction::plan(&self.strategy, entry, headroom, candidates) {
            Ok(plan) => plan,
            Err(shortfall) if no_candidates && blocked => {
                return Err(ResourceError::PinnedResourceUnavailable {
                    model_type: model_type.clone(),
                    shortfall,
                })
            }
            Err(shortfall) => {
                return Err(ResourceError::Infeasible {
                    model_type: model_type.clone(),
                    shortfall,
                })
            }
        };

        if options.is_cancelled() {
            return Err(ResourceError::Cancelled(model_type.clone()));
        }

        info!(
            model_type = %model_type,
            victims = ?plan.victim_types(),
            projected = %plan.projected,
            "Evicting to make room"
        );

        let mut evicted = Vec::with_capacity(plan.victims.len());
        for victim in plan.victims {
            let claimed = self.with_slot(&victim.model_type, |slot| {
                if slot.info.can_unload() {
                    slot.info.state = ModelState::Unloading;
                    Some(slot.commitment.take())
                } else {
                    None
                }
            })?;

            let Some(commitment) = claimed else {
                warn!(model_type = %victim.model_type, "Eviction candidate no longer evictable, skipping");
                continue;
            };

            self.unload_claimed(&victim.model_type, commitment, ModelState::Unloaded)
                .await?;
            evicted.push(victim.model_type);
        }

        Ok(evicted)
    }

    /// Unload a slot already claimed as `Unloading`.
    ///
    /// On success the reservation is released and the slot moves to `next`
    /// (`Unloaded`, or `Loading` when reloading). On failure the slot is
    /// restored to `Loaded` with its reservation intact.
    async fn unload_claimed(
        &self,
        model_type: &ModelType,
        commitment: Option<Commitment>,
        next: ModelState,
    ) -> Result<()> {
        let (loader, model_id) = self.with_slot(model_type, |slot| {
            (Arc::clone(&slot.loader), slot.info.model_id.clone())
        })?;

        info!(model_type = %model_type, "Unloading model");
        match loader.unload(model_type, &model_id).await {
            Ok(()) => {
                if let Some(commitment) = commitment {
                    self.allocator.release(commitment);
                }
                self.with_slot(model_type, |slot| {
                    slot.info.mark_unloaded();
                    slot.info.state = next;
                })?;
                info!(model_type = %model_type, "Model unloaded");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!(model_type = %model_type, "Unloader failed: {}", message);
                let last_error = message.clone();
                self.with_slot(model_type, |slot| {
                    slot.info.state = ModelState::Loaded;
                    slot.info.last_error = Some(last_error);
                    slot.commitment = commitment;
                })?;
                Err(ResourceError::UnloaderFailed {
                    model_type: model_type.clone(),
                    message,
                })
            }
        }
    }
}
