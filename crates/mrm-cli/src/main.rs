//! mrm - Command-line interface for the model resource manager

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrm_core::{Config, LoggingConfig, ModelType};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::simulate::SimulateOptions;
use output::{OutputFormat, OutputFormatter};

/// Command-line interface for the model resource manager
#[derive(Debug, Parser)]
#[command(name = "mrm")]
#[command(about = "Profile devices and exercise model admission on a shared GPU")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable JSON output (overrides --output)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Profile every configured device
    Profile,

    /// Print or write the default configuration as YAML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    Validate {
        /// File to validate (defaults to the global --config)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Activate model types in order against mock loaders
    Simulate {
        /// Model types to activate, in order
        #[arg(required = true, value_name = "MODEL_TYPE")]
        model_types: Vec<ModelType>,

        /// Pin a model type before activating anything
        #[arg(long, value_name = "MODEL_TYPE")]
        pin: Vec<ModelType>,

        /// Canvas history VRAM to report on the default device
        #[arg(long, value_name = "GB", default_value = "0")]
        canvas_vram_gb: f64,

        /// Use the mock hardware backend regardless of configuration
        #[arg(long)]
        mock_hardware: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.show_target)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that inspect a file or emit defaults must not depend on the ambient config
    let config = match &cli.command {
        Commands::Config { .. } | Commands::Validate { .. } => None,
        _ => Some(load_config(cli.config.as_deref())?),
    };

    let default_logging = LoggingConfig::default();
    init_logging(
        config.as_ref().map_or(&default_logging, |c| &c.logging),
        cli.verbose,
    );
    debug!("Starting mrm CLI with arguments: {:?}", cli);

    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        cli.output
    };

    match (cli.command, config) {
        (Commands::Profile, Some(config)) => {
            commands::profile::profile_devices(&config, output_format).await?;
        }

        (Commands::Config { output }, _) => {
            commands::config::show_default_config(output.as_deref(), output_format)?;
        }

        (Commands::Validate { config: path }, _) => {
            let path = path
                .or(cli.config)
                .context("validate needs a file: pass --config FILE")?;
            if let Err(e) = commands::config::validate_config(&path, output_format) {
                OutputFormatter::new(output_format).print_error(&format!("{:#}", e))?;
                std::process::exit(1);
            }
        }

        (
            Commands::Simulate {
                model_types,
                pin,
                canvas_vram_gb,
                mock_hardware,
            },
            Some(config),
        ) => {
            let options = SimulateOptions {
                model_types,
                pins: pin,
                canvas_vram_gb,
                mock_hardware,
            };
            commands::simulate::simulate(&config, options, output_format).await?;
        }

        (command, None) => anyhow::bail!("no configuration loaded for {:?}", command),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "mrm", "--output", "json", "simulate", "tts", "llm", "--pin", "stt",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Simulate {
                model_types, pin, ..
            } => {
                assert_eq!(model_types, vec![ModelType::Tts, ModelType::Llm]);
                assert_eq!(pin, vec![ModelType::Stt]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_simulate_requires_model_types() {
        assert!(Cli::try_parse_from(["mrm", "simulate"]).is_err());
    }

    #[test]
    fn test_parse_validate_and_config() {
        let cli = Cli::try_parse_from(["mrm", "validate", "--config", "mrm.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Validate { config: Some(ref path) } if path == Path::new("mrm.yaml")
        ));

        let cli = Cli::try_parse_from(["mrm", "--json", "config", "--output", "out.yaml"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.output, OutputFormat::Table);
        assert!(matches!(cli.command, Commands::Config { output: Some(_) }));
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Some(Path::new("/nonexistent/mrm.yaml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/mrm.yaml"));
    }
}
