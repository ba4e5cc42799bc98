//! Configuration module for the pipeline autotuner
//!
//! This module handles the file-backed configuration of the autotuner:
//! which search algorithm to run, the CPU and RAM budgets, the optimizer
//! constants and the logging setup.
//!
//! # Config Location
//!
//! Without an explicit path the config is read from the platform config
//! directory:
//! - **Linux**: `~/.config/pipeline-autotune/autotune.toml`
//! - **macOS**: `~/Library/Application Support/pipeline-autotune/autotune.toml`
//! - **Windows**: `%APPDATA%\pipeline-autotune\autotune.toml`
//!
//! # Environment Overrides
//!
//! After a file is loaded, these variables take precedence:
//! - `AUTOTUNE_ALGORITHM` - `hill_climb`, `gradient_descent`, `0` or `1`
//! - `AUTOTUNE_CPU_BUDGET` - integer, 0 means "all schedulable CPUs"
//! - `AUTOTUNE_RAM_BUDGET` - integer bytes, 0 means "share of available RAM"
//!
//! # Example
//!
//! ```ignore
//! use pipeline_autotune::config::AutotuneConfig;
//!
//! let config = AutotuneConfig::load_or_default(None).with_env_overrides()?;
//! let options = pipeline_autotune::AutotuneOptions::from(&config);
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{AutotuneError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "pipeline-autotune";

/// Config filename
pub const CONFIG_FILE: &str = "autotune.toml";

/// Environment variable overriding the algorithm
pub const ENV_ALGORITHM: &str = "AUTOTUNE_ALGORITHM";

/// Environment variable overriding the CPU budget
pub const ENV_CPU_BUDGET: &str = "AUTOTUNE_CPU_BUDGET";

/// Environment variable overriding the RAM budget
pub const ENV_RAM_BUDGET: &str = "AUTOTUNE_RAM_BUDGET";

// ==================== Config Directory ====================

/// Get the platform config directory for the autotuner
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Autotune Config ====================

/// File-backed autotuner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneConfig {
    /// Version for future migration support
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Search algorithm run by each optimization cycle
    #[serde(default)]
    pub algorithm: AutotuneAlgorithm,

    /// CPU budget in cores; 0 resolves to the schedulable CPU count
    #[serde(default)]
    pub cpu_budget: i64,

    /// RAM budget in bytes; 0 resolves to a share of available RAM
    #[serde(default)]
    pub ram_budget: i64,

    /// Optimizer constants
    #[serde(default)]
    pub optimizer: OptimizerSettings,

    /// Logging setup
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_config_version() -> u32 {
    1
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            version: default_config_version(),
            algorithm: AutotuneAlgorithm::default(),
            cpu_budget: 0,
            ram_budget: 0,
            optimizer: OptimizerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AutotuneConfig {
    /// Parse a config from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AutotuneConfig = toml::from_str(content)
            .map_err(|e| AutotuneError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AutotuneError::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::from_toml_str(&content).with_context(|| format!("{:?}", path))
    }

    /// Load from `path`, or from the default location when `path` is `None`
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load a config, returning defaults if any error occurs
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load autotune config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AutotuneError::Configuration(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            AutotuneError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            AutotuneError::Configuration(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Reject negative budgets and unusable optimizer settings
    pub fn validate(&self) -> Result<()> {
        if self.cpu_budget < 0 {
            return Err(AutotuneError::Configuration(format!(
                "cpu_budget must be >= 0, got {}",
                self.cpu_budget
            )));
        }
        if self.ram_budget < 0 {
            return Err(AutotuneError::Configuration(format!(
                "ram_budget must be >= 0, got {}",
                self.ram_budget
            )));
        }
        self.optimizer.validate()
    }

    /// Apply `AUTOTUNE_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, then re-validate
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ALGORITHM) {
            self.algorithm = value.parse()?;
        }
        if let Some(value) = lookup(ENV_CPU_BUDGET) {
            self.cpu_budget = parse_budget(ENV_CPU_BUDGET, &value)?;
        }
        if let Some(value) = lookup(ENV_RAM_BUDGET) {
            self.ram_budget = parse_budget(ENV_RAM_BUDGET, &value)?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_budget(key: &str, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|e| {
        AutotuneError::Configuration(format!("{} is not an integer ('{}'): {}", key, value, e))
    })
}
