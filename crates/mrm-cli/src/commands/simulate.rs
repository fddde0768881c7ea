//! Dry-run activation scenario against mock loaders

use crate::output::{colorize_state, format_gb, Formattable, OutputFormat, OutputFormatter};
use anyhow::Result;
use mrm_core::{
    ActiveModelInfo, Config, MemoryAllocationBreakdown, MockModelLoader, ModelType, ProfilerBackend,
    Variant,
};
use mrm_manager::{ActivationOutcome, ManagerBuilder, ManagerSnapshot, ResourceError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub model_types: Vec<ModelType>,
    pub pins: Vec<ModelType>,
    pub canvas_vram_gb: f64,
    pub mock_hardware: bool,
}

/// Result of one activation request
#[derive(Debug, Clone, Serialize)]
pub struct StepRow {
    pub model_type: ModelType,
    pub outcome: String,
    pub variant: Option<Variant>,
    pub vram_gb: f64,
    pub ram_gb: f64,
    pub evicted: Vec<ModelType>,
    pub error: Option<String>,
}

impl StepRow {
    fn from_outcome(outcome: ActivationOutcome) -> Self {
        Self {
            outcome: if outcome.already_active {
                "already_active".to_string()
            } else {
                "loaded".to_string()
            },
            model_type: outcome.model_type,
            variant: Some(outcome.active_variant),
            vram_gb: outcome.vram_allocated_gb,
            ram_gb: outcome.ram_allocated_gb,
            evicted: outcome.evicted,
            error: None,
        }
    }

    fn failed(model_type: ModelType, error: &ResourceError) -> Self {
        Self {
            model_type,
            outcome: error.category().to_string(),
            variant: None,
            vram_gb: 0.0,
            ram_gb: 0.0,
            evicted: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    fn evicted_label(&self) -> String {
        if self.evicted.is_empty() {
            "-".to_string()
        } else {
            self.evicted
                .iter()
                .map(ModelType::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

fn variant_label(variant: Option<&Variant>) -> String {
    variant.map_or_else(|| "-".to_string(), Variant::to_string)
}

impl Formattable for StepRow {
    fn table_headers() -> Vec<String> {
        vec![
            "Model".to_string(),
            "Outcome".to_string(),
            "Variant".to_string(),
            "VRAM".to_string(),
            "RAM".to_string(),
            "Evicted".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.model_type.to_string(),
            self.error.clone().unwrap_or_else(|| self.outcome.clone()),
            variant_label(self.variant.as_ref()),
            format_gb(self.vram_gb),
            format_gb(self.ram_gb),
            self.evicted_label(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("Model".to_string(), self.model_type.to_string()),
            ("Outcome".to_string(), self.outcome.clone()),
            ("Variant".to_string(), variant_label(self.variant.as_ref())),
            ("VRAM".to_string(), format_gb(self.vram_gb)),
            ("RAM".to_string(), format_gb(self.ram_gb)),
            ("Evicted".to_string(), self.evicted_label()),
        ];
        if let Some(error) = &self.error {
            pairs.push(("Error".to_string(), error.clone()));
        }
        pairs
    }
}

impl Formattable for ActiveModelInfo {
    fn table_headers() -> Vec<String> {
        vec![
            "Model".to_string(),
            "Id".to_string(),
            "Device".to_string(),
            "State".to_string(),
            "Variant".to_string(),
            "VRAM".to_string(),
            "RAM".to_string(),
            "Pinned".to_string(),
            "Jobs".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.model_type.to_string(),
            self.model_id.clone(),
            self.device.to_string(),
            colorize_state(self.state).to_string(),
            variant_label(self.active_variant.as_ref()),
            format_gb(self.vram_allocated_gb),
            format_gb(self.ram_allocated_gb),
            if self.pinned { "yes" } else { "no" }.to_string(),
            self.busy_jobs.to_string(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Model".to_string(), self.model_type.to_string()),
            ("Id".to_string(), self.model_id.clone()),
            ("Device".to_string(), self.device.to_string()),
            ("State".to_string(), self.state.to_string()),
            ("Variant".to_string(), variant_label(self.active_variant.as_ref())),
            ("VRAM".to_string(), format_gb(self.vram_allocated_gb)),
            ("RAM".to_string(), format_gb(self.ram_allocated_gb)),
            ("Pinned".to_string(), self.pinned.to_string()),
            ("Busy Jobs".to_string(), self.busy_jobs.to_string()),
            (
                "Last Error".to_string(),
                self.last_error.clone().unwrap_or_else(|| "-".to_string()),
            ),
        ]
    }
}

impl Formattable for MemoryAllocationBreakdown {
    fn table_headers() -> Vec<String> {
        vec![
            "Device".to_string(),
            "VRAM Total".to_string(),
            "Models".to_string(),
            "Canvas".to_string(),
            "Reserve".to_string(),
            "External".to_string(),
            "VRAM Free".to_string(),
            "RAM Total".to_string(),
            "RAM Free".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.device.to_string(),
            format_gb(self.total_available_vram_gb),
            format_gb(self.models_vram_gb),
            format_gb(self.canvas_history_vram_gb),
            format_gb(self.system_reserve_vram_gb),
            format_gb(self.external_apps_vram_gb),
            format_gb(self.available_for_models_vram_gb()),
            format_gb(self.total_available_ram_gb),
            format_gb(self.available_for_models_ram_gb()),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Device".to_string(), self.device.to_string()),
            ("Total VRAM".to_string(), format_gb(self.total_available_vram_gb)),
            ("Models VRAM".to_string(), format_gb(self.models_vram_gb)),
            ("Canvas VRAM".to_string(), format_gb(self.canvas_history_vram_gb)),
            ("Reserve VRAM".to_string(), format_gb(self.system_reserve_vram_gb)),
            ("External VRAM".to_string(), format_gb(self.external_apps_vram_gb)),
            ("Free VRAM".to_string(), format_gb(self.available_for_models_vram_gb())),
            ("Total RAM".to_string(), format_gb(self.total_available_ram_gb)),
            ("Models RAM".to_string(), format_gb(self.models_ram_gb)),
            ("Free RAM".to_string(), format_gb(self.available_for_models_ram_gb())),
        ]
    }
}

/// Every step plus the final manager snapshot
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<StepRow>,
    pub snapshot: ManagerSnapshot,
}

/// Run the scenario and print it
pub async fn simulate(config: &Config, options: SimulateOptions, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let report = run_simulation(config, options).await?;

    if formatter.is_structured() {
        return formatter.print_document(&report);
    }

    formatter.print_heading("Activations");
    formatter.print_list(&report.steps)?;

    let models: Vec<ActiveModelInfo> = report.snapshot.models.values().cloned().collect();
    formatter.print_heading("Models");
    formatter.print_list(&models)?;

    let breakdowns: Vec<MemoryAllocationBreakdown> =
        report.snapshot.breakdowns.values().cloned().collect();
    formatter.print_heading("Memory");
    formatter.print_list(&breakdowns)
}

/// Build a manager over mock loaders and activate each model type in order.
///
/// Admission failures are recorded per step; only setup errors abort.
pub async fn run_simulation(config: &Config, options: SimulateOptions) -> Result<SimulationReport> {
    let mut config = config.clone();
    if options.mock_hardware {
        config.profiler.backend = ProfilerBackend::Mock;
    }

    let loader = Arc::new(MockModelLoader::new());
    let manager = ManagerBuilder::from_config(&config)?
        .shared_loader(loader)
        .build()?;

    for model_type in &options.pins {
        manager.set_pin(model_type, true)?;
    }
    if options.canvas_vram_gb > 0.0 {
        manager.report_canvas_history(&config.default_device, options.canvas_vram_gb, 0.0);
    }

    let mut steps = Vec::with_capacity(options.model_types.len());
    for model_type in options.model_types {
        match manager.activate(model_type.clone()).await {
            Ok(outcome) => {
                info!(
                    model_type = %model_type,
                    variant = %outcome.active_variant,
                    evicted = outcome.evicted.len(),
                    "Simulated activation"
                );
                steps.push(StepRow::from_outcome(outcome));
            }
            Err(e) => {
                warn!(model_type = %model_type, "Simulated activation failed: {}", e);
                steps.push(StepRow::failed(model_type, &e));
            }
        }
    }

    let snapshot = manager.snapshot().await;
    Ok(SimulationReport { steps, snapshot })
}
