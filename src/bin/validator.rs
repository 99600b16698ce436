//! Schema Validator CLI
//!
//! Validates every generation target of a tracking plan and prints the
//! resolved model for downstream generators.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracking_schemas::config::OutputFormat;
use tracking_schemas::{
    check_config, load_config, load_target, SchemaConfig, SchemaError, TargetOutcome,
};

#[derive(Parser)]
#[command(name = "schema-validator")]
#[command(about = "Validate tracking plan documents and resolve generation targets")]
struct Cli {
    /// Tool settings file (defaults to schemas.toml lookup)
    #[arg(short, long)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every target and report all defects
    Check {
        /// Generation config (overrides the configured one)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the resolved model of one target as JSON
    Model {
        /// Generation config (overrides the configured one)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Index of the target in the config
        #[arg(short, long, default_value_t = 0)]
        target: usize,
        /// Compact JSON regardless of settings
        #[arg(long)]
        compact: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every checked target was valid
fn run(cli: Cli) -> anyhow::Result<bool> {
    let settings = SchemaConfig::load_from(cli.settings.as_deref()).context("loading settings")?;
    let options = settings.load_options();

    match cli.command {
        Commands::Check { config } => {
            let config_path = config.unwrap_or_else(|| settings.config_file());
            println!("🔍 Checking {}", config_path.display());
            println!();

            let reports = check_config(&config_path, &options)?;
            let mut all_valid = true;

            for report in &reports {
                match &report.outcome {
                    TargetOutcome::Resolved(model) => {
                        let fingerprint = model.fingerprint()?;
                        println!(
                            "✅ target {} ({}) - {} events, {} groups, {} dimensions [{}]",
                            report.index,
                            report.output,
                            model.events.len(),
                            model.groups.len(),
                            model.dimensions.len(),
                            fingerprint.short()
                        );
                    }
                    TargetOutcome::Invalid(errors) => {
                        all_valid = false;
                        println!(
                            "❌ target {} ({}) - {} error(s)",
                            report.index,
                            report.output,
                            errors.len()
                        );
                        for error in errors {
                            println!("   └─ [{}] {}", error.code(), error);
                        }
                    }
                    TargetOutcome::Aborted(e) => {
                        all_valid = false;
                        println!(
                            "❌ target {} ({}) - aborted: {}",
                            report.index, report.output, e
                        );
                    }
                }
            }

            println!();
            if all_valid {
                println!("✅ All {} target(s) valid", reports.len());
            } else {
                println!("❌ Tracking plan has errors");
            }
            Ok(all_valid)
        }

        Commands::Model { config, target, compact } => {
            let config_path = config.unwrap_or_else(|| settings.config_file());
            let generation = load_config(&config_path)?;
            let Some(selected) = generation.generates.get(target) else {
                return Err(SchemaError::UnknownTarget {
                    index: target,
                    count: generation.generates.len(),
                }
                .into());
            };

            let base_dir = config_path.parent().map(PathBuf::from).unwrap_or_default();
            let model = match load_target(&base_dir, selected, &options)? {
                Ok(model) => model,
                Err(errors) => {
                    for error in &errors {
                        eprintln!("[{}] {}", error.code(), error);
                    }
                    bail!("target {} has {} error(s)", target, errors.len());
                }
            };

            let json = if compact || settings.output.output_format == OutputFormat::Compact {
                serde_json::to_string(&model)?
            } else {
                serde_json::to_string_pretty(&model)?
            };
            println!("{}", json);
            Ok(true)
        }
    }
}
