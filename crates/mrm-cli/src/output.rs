//! Output formatting for the mrm CLI

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use mrm_core::ModelState;
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Compact text format
    Text,
}

/// Trait for types that can be formatted for output
pub trait Formattable {
    /// Format as a table row
    fn table_headers() -> Vec<String>;
    fn table_row(&self) -> Vec<String>;

    /// Format as key-value pairs for detailed view
    fn key_value_pairs(&self) -> Vec<(String, String)>;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// JSON and YAML print whole documents instead of sections
    pub fn is_structured(&self) -> bool {
        matches!(self.format, OutputFormat::Json | OutputFormat::Yaml)
    }

    /// Print any serializable value as a JSON or YAML document
    pub fn print_document<T: Serialize>(&self, value: &T) -> Result<()> {
        match self.format {
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            _ => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }

    /// Format and print a list of items
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        if items.is_empty() {
            match self.format {
                OutputFormat::Json | OutputFormat::Yaml => println!("[]"),
                OutputFormat::Table | OutputFormat::Text => {
                    println!("{}", "No items found".dimmed());
                }
            }
            return Ok(());
        }

        match self.format {
            OutputFormat::Json | OutputFormat::Yaml => self.print_document(&items)?,
            OutputFormat::Table => self.print_table(items),
            OutputFormat::Text => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        println!();
                    }
                    for (key, value) in item.key_value_pairs() {
                        println!("{}: {}", key, value);
                    }
                }
            }
        }
        Ok(())
    }

    fn print_table<T: Formattable>(&self, items: &[T]) {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);

        let header_cells: Vec<Cell> = T::table_headers()
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
            .collect();
        table.set_header(header_cells);

        for item in items {
            table.add_row(item.table_row());
        }

        println!("{}", table);
    }

    /// Print a section heading (interactive formats only)
    pub fn print_heading(&self, title: &str) {
        match self.format {
            OutputFormat::Table => println!("\n{}", title.bold()),
            OutputFormat::Text => println!("\n# {}", title),
            _ => {}
        }
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "status": "success",
                    "message": message
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Yaml => {
                println!("status: success");
                println!("message: {}", message);
            }
            OutputFormat::Table | OutputFormat::Text => {
                println!("{} {}", "✓".green().bold(), message.green());
            }
        }
        Ok(())
    }

    pub fn print_error(&self, message: &str) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "status": "error",
                    "message": message
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Yaml => {
                println!("status: error");
                println!("message: {}", message);
            }
            OutputFormat::Table | OutputFormat::Text => {
                eprintln!("{} {}", "✗".red().bold(), message.red());
            }
        }
        Ok(())
    }

    /// Print a progress message (only for interactive formats)
    pub fn print_progress(&self, message: &str) {
        if let OutputFormat::Table | OutputFormat::Text = self.format {
            eprint!("{} {}...\r", "⏳".yellow(), message);
        }
    }

    /// Clear progress message (only for interactive formats)
    pub fn clear_progress(&self) {
        if let OutputFormat::Table | OutputFormat::Text = self.format {
            eprint!("\r{}\r", " ".repeat(80));
        }
    }
}

/// Gigabytes with two decimals
pub fn format_gb(value: f64) -> String {
    format!("{:.2} GB", value)
}

pub fn colorize_state(state: ModelState) -> ColoredString {
    let label = state.to_string();
    match state {
        ModelState::Loaded => label.green(),
        ModelState::Busy => label.cyan(),
        ModelState::Loading | ModelState::Unloading => label.yellow(),
        ModelState::Unloaded => label.dimmed(),
    }
}
