//! Configuration for the tracking schema tools
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schemas.toml)
//! - Environment variables (SCHEMAS__*)
//!
//! ## Example config file (schemas.toml):
//! ```toml
//! [project]
//! config_file = "analytics/tracking.config.json"
//!
//! [output]
//! output_format = "compact"
//!
//! [validation]
//! resolve_despite_structural_errors = false
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::loader::LoadOptions;

/// Main configuration for the tracking schema tools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Where the generation config lives
    #[serde(default)]
    pub project: ProjectConfig,

    /// Model output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Validation settings
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Path to the generation config listing every target
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format (pretty or compact)
    #[serde(default)]
    pub output_format: OutputFormat,
}

/// Output format for JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pretty,
    Compact,
}

/// Validation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Keep resolving a target whose documents failed structural checks
    #[serde(default)]
    pub resolve_despite_structural_errors: bool,
}

fn default_config_file() -> PathBuf {
    PathBuf::from("tracking.config.json")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
        }
    }
}

impl From<&ValidationConfig> for LoadOptions {
    fn from(config: &ValidationConfig) -> Self {
        LoadOptions {
            resolve_despite_structural_errors: config.resolve_despite_structural_errors,
        }
    }
}

impl SchemaConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["schemas.toml", ".schemas.toml", "config/schemas.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) =
            directories::ProjectDirs::from("dev", "tracking", "tracking-schemas")
        {
            let xdg_config = config_dir.config_dir().join("schemas.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (SCHEMAS__*)
        builder = builder.add_source(
            Environment::with_prefix("SCHEMAS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Generation config path, resolved against the working directory
    pub fn config_file(&self) -> PathBuf {
        if self.project.config_file.is_absolute() {
            self.project.config_file.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.project.config_file)
        }
    }

    /// Options for loading targets
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions::from(&self.validation)
    }
}
