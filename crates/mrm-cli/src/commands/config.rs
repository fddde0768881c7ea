//! Configuration commands

use crate::output::{OutputFormat, OutputFormatter};
use anyhow::{Context, Result};
use mrm_core::Config;
use std::path::Path;
use tracing::info;

/// Print the default configuration, or write it to `output`
pub fn show_default_config(output: Option<&Path>, output_format: OutputFormat) -> Result<()> {
    let yaml = serde_yaml::to_string(&Config::default())?;

    match output {
        Some(path) => {
            std::fs::write(path, yaml)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote default configuration");
            OutputFormatter::new(output_format)
                .print_success(&format!("Wrote default configuration to {}", path.display()))
        }
        None => {
            print!("{}", yaml);
            Ok(())
        }
    }
}

/// Load a configuration file through every layer and validate it
pub fn validate_config(path: &Path, output_format: OutputFormat) -> Result<()> {
    let config = load_and_validate(path)?;
    OutputFormatter::new(output_format).print_success(&format!(
        "{} is valid: {} catalog entries across {} device(s)",
        path.display(),
        config.catalog.len(),
        config.devices().len()
    ))
}

fn load_and_validate(path: &Path) -> Result<Config> {
    Config::load_from_file(path).with_context(|| format!("{} is not a valid configuration", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrm_core::{DeviceRef, ModelType};
    use std::io::Write;
    use tempfile::{Builder, TempDir};

    #[test]
    fn test_written_default_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mrm.yaml");

        show_default_config(Some(&path), OutputFormat::Text).unwrap();

        let config = load_and_validate(&path).unwrap();
        assert_eq!(config.default_device, DeviceRef::cuda(0));
        assert_eq!(config.catalog.len(), Config::default().catalog.len());
    }

    #[test]
    fn test_validate_accepts_partial_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "default_device: \"cuda:1\"\nmemory:\n  system_reserve_vram_gb: 2.0\nmodels:\n  stt:\n    device: \"cuda:0\"\n    prevent_unload: true"
        )
        .unwrap();

        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.default_device, DeviceRef::cuda(1));
        assert_eq!(config.device_for(&ModelType::Stt), DeviceRef::cuda(0));
        assert!(config.prevent_unload(&ModelType::Stt));
        validate_config(file.path(), OutputFormat::Text).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "memory:\n  system_reserve_vram_gb: -1.0").unwrap();

        let err = validate_config(file.path(), OutputFormat::Text).unwrap_err();
        assert!(format!("{:#}", err).contains("is not a valid configuration"));
    }
}
