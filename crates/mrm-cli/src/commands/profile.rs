//! Device profiling command

use crate::output::{format_gb, Formattable, OutputFormat, OutputFormatter};
use anyhow::Result;
use mrm_adapter_hw::{HardwareProfile, HardwareProfiler};
use mrm_core::Config;
use serde::Serialize;

/// One profiled device as printed by `mrm profile`
#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub backend: String,
    #[serde(flatten)]
    pub profile: HardwareProfile,
}

impl Formattable for DeviceRow {
    fn table_headers() -> Vec<String> {
        vec![
            "Device".to_string(),
            "Backend".to_string(),
            "Tier".to_string(),
            "VRAM Free".to_string(),
            "VRAM Total".to_string(),
            "RAM Free".to_string(),
            "RAM Total".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        let p = &self.profile;
        vec![
            p.device.to_string(),
            self.backend.clone(),
            tier_label(p),
            format_gb(p.free_vram_gb),
            format_gb(p.total_vram_gb),
            format_gb(p.free_ram_gb),
            format_gb(p.total_ram_gb),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        let p = &self.profile;
        vec![
            ("Device".to_string(), p.device.to_string()),
            ("Backend".to_string(), self.backend.clone()),
            ("Compute Tier".to_string(), tier_label(p)),
            ("Free VRAM".to_string(), format_gb(p.free_vram_gb)),
            ("Total VRAM".to_string(), format_gb(p.total_vram_gb)),
            ("Free RAM".to_string(), format_gb(p.free_ram_gb)),
            ("Total RAM".to_string(), format_gb(p.total_ram_gb)),
            ("Profiled At".to_string(), p.profiled_at.to_rfc3339()),
            ("Age".to_string(), format!("{} ms", p.age_ms())),
        ]
    }
}

fn tier_label(profile: &HardwareProfile) -> String {
    profile
        .compute_tier
        .map(|tier| tier.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Profile every configured device plus any the backend enumerates
pub async fn profile_devices(config: &Config, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let rows = collect_profiles(config).await;
    formatter.print_list(&rows)
}

async fn collect_profiles(config: &Config) -> Vec<DeviceRow> {
    let formatter = OutputFormatter::new(OutputFormat::Table);
    let profiler = HardwareProfiler::from_config(&config.profiler);

    let mut devices = config.devices();
    for device in profiler.list_devices().await {
        if !devices.contains(&device) {
            devices.push(device);
        }
    }

    let mut rows = Vec::with_capacity(devices.len());
    for device in devices {
        formatter.print_progress(&format!("Profiling {}", device));
        let profile = profiler.profile(&device).await;
        formatter.clear_progress();
        rows.push(DeviceRow {
            backend: profiler.backend_name().to_string(),
            profile,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrm_core::{ComputeTier, DeviceRef, MockDeviceConfig, ProfilerBackend};

    #[tokio::test]
    async fn test_collect_profiles_from_mock_backend() {
        let mut config = Config::default();
        config.profiler.backend = ProfilerBackend::Mock;
        config.profiler.mock_devices = vec![
            MockDeviceConfig {
                device: DeviceRef::cuda(0),
                total_vram_gb: 12.0,
                compute_tier: Some(ComputeTier::Ampere),
            },
            MockDeviceConfig {
                device: DeviceRef::cuda(1),
                total_vram_gb: 24.0,
                compute_tier: Some(ComputeTier::Hopper),
            },
        ];

        let rows = collect_profiles(&config).await;
        let devices: Vec<&DeviceRef> = rows.iter().map(|r| &r.profile.device).collect();
        assert_eq!(devices, vec![&DeviceRef::cuda(0), &DeviceRef::cuda(1)]);
        assert_eq!(rows[1].profile.total_vram_gb, 24.0);
        assert_eq!(rows[0].backend, "mock");
        assert_eq!(rows[0].table_row()[2], "ampere");

        let pairs = rows[0].key_value_pairs();
        let (key, age) = pairs.last().unwrap();
        assert_eq!(key, "Age");
        assert!(age.ends_with(" ms"));
    }
}
