//! Tuning settings shared by the optimizer and the controller
//!
//! This module contains the knobs that shape how the autotuner searches,
//! separate from the budgets that bound it. Everything here has a default
//! that matches the behavior of the built-in controller, so a config file
//! only needs to name what it changes.
//!
//! # Main Types
//!
//! - [`AutotuneAlgorithm`] - Which search strategy `optimize` runs
//! - [`OptimizerSettings`] - Backoff periods and search constants
//! - [`LoggingSettings`] - Filter level and optional rolling log file

use crate::error::{AutotuneError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Search strategy used by `Model::optimize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotuneAlgorithm {
    /// Greedy one-step increments, stopping at the first plateau
    #[default]
    HillClimb,
    /// Projected gradient descent over a continuous relaxation
    GradientDescent,
}

impl AutotuneAlgorithm {
    /// All algorithms, in their integer-code order
    pub const ALL: [AutotuneAlgorithm; 2] =
        [AutotuneAlgorithm::HillClimb, AutotuneAlgorithm::GradientDescent];

    /// Stable lowercase name, as used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            AutotuneAlgorithm::HillClimb => "hill_climb",
            AutotuneAlgorithm::GradientDescent => "gradient_descent",
        }
    }
}

impl fmt::Display for AutotuneAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutotuneAlgorithm {
    type Err = AutotuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hill_climb" | "hillclimb" | "0" => Ok(AutotuneAlgorithm::HillClimb),
            "gradient_descent" | "gradientdescent" | "1" => {
                Ok(AutotuneAlgorithm::GradientDescent)
            }
            other => Err(AutotuneError::Configuration(format!(
                "Unknown autotune algorithm '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<i64> for AutotuneAlgorithm {
    type Error = AutotuneError;

    fn try_from(code: i64) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| {
                AutotuneError::Configuration(format!("Unknown autotune algorithm code {}", code))
            })
    }
}

/// Backoff and search constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// First optimization period of the controller in milliseconds
    #[serde(default = "default_initial_period_ms")]
    pub initial_period_ms: u64,

    /// Ceiling of the doubling backoff in milliseconds
    #[serde(default = "default_max_period_ms")]
    pub max_period_ms: u64,

    /// Share of available RAM used when the RAM budget is 0
    #[serde(default = "default_ram_budget_share")]
    pub ram_budget_share: f64,

    /// Minimum improvement (ns) a hill-climb `buffer_size` step must buy
    #[serde(default = "default_buffer_size_min_delta_ns")]
    pub buffer_size_min_delta_ns: f64,

    /// Gradient-descent step as a fraction of the largest gradient component
    #[serde(default = "default_descent_step")]
    pub descent_step: f64,

    /// Gradient descent stops once an iteration improves by less than this (ns)
    #[serde(default = "default_descent_precision_ns")]
    pub descent_precision_ns: f64,

    /// Hard cap on gradient-descent iterations
    #[serde(default = "default_descent_max_iterations")]
    pub descent_max_iterations: u32,
}

fn default_initial_period_ms() -> u64 {
    10
}

fn default_max_period_ms() -> u64 {
    60_000
}

fn default_ram_budget_share() -> f64 {
    0.5
}

fn default_buffer_size_min_delta_ns() -> f64 {
    1.0
}

fn default_descent_step() -> f64 {
    0.1
}

fn default_descent_precision_ns() -> f64 {
    100.0
}

fn default_descent_max_iterations() -> u32 {
    1000
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            initial_period_ms: default_initial_period_ms(),
            max_period_ms: default_max_period_ms(),
            ram_budget_share: default_ram_budget_share(),
            buffer_size_min_delta_ns: default_buffer_size_min_delta_ns(),
            descent_step: default_descent_step(),
            descent_precision_ns: default_descent_precision_ns(),
            descent_max_iterations: default_descent_max_iterations(),
        }
    }
}

impl OptimizerSettings {
    /// Initial controller period as a [`Duration`]
    pub fn initial_period(&self) -> Duration {
        Duration::from_millis(self.initial_period_ms)
    }

    /// Maximum controller period as a [`Duration`]
    pub fn max_period(&self) -> Duration {
        Duration::from_millis(self.max_period_ms)
    }

    /// Reject settings the controller or optimizer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.initial_period_ms == 0 {
            return Err(AutotuneError::Configuration(
                "optimizer.initial_period_ms must be > 0".to_string(),
            ));
        }
        if self.max_period_ms < self.initial_period_ms {
            return Err(AutotuneError::Configuration(format!(
                "optimizer.max_period_ms ({}) is below initial_period_ms ({})",
                self.max_period_ms, self.initial_period_ms
            )));
        }
        if !(self.ram_budget_share > 0.0 && self.ram_budget_share <= 1.0) {
            return Err(AutotuneError::Configuration(format!(
                "optimizer.ram_budget_share must be in (0, 1], got {}",
                self.ram_budget_share
            )));
        }
        if !(self.descent_step.is_finite() && self.descent_step > 0.0) {
            return Err(AutotuneError::Configuration(format!(
                "optimizer.descent_step must be > 0, got {}",
                self.descent_step
            )));
        }
        if !(self.descent_precision_ns.is_finite() && self.descent_precision_ns >= 0.0) {
            return Err(AutotuneError::Configuration(format!(
                "optimizer.descent_precision_ns must be >= 0, got {}",
                self.descent_precision_ns
            )));
        }
        if !(self.buffer_size_min_delta_ns.is_finite() && self.buffer_size_min_delta_ns >= 0.0) {
            return Err(AutotuneError::Configuration(format!(
                "optimizer.buffer_size_min_delta_ns must be >= 0, got {}",
                self.buffer_size_min_delta_ns
            )));
        }
        if self.descent_max_iterations == 0 {
            return Err(AutotuneError::Configuration(
                "optimizer.descent_max_iterations must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration consumed by [`crate::logging::init_tracing`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive used when neither `AUTOTUNE_LOG` nor `RUST_LOG` is set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for a daily rolling log file (stderr only when unset)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// File name prefix for the rolling log
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Colorize terminal output
    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_prefix() -> String {
    "autotune.log".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            file_prefix: default_log_file_prefix(),
            ansi: true,
        }
    }
}

impl LoggingSettings {
    /// Verbose preset for local runs
    pub fn development() -> Self {
        Self {
            level: "debug,pipeline_autotune=trace".to_string(),
            ..Self::default()
        }
    }

    /// Quiet preset for tests; warnings and errors only, no colors
    pub fn testing() -> Self {
        Self {
            level: "warn".to_string(),
            ansi: false,
            ..Self::default()
        }
    }
}
