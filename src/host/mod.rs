//! Clock and budget source
//!
//! Everything the autotuner needs to know about the machine it runs on:
//! a monotonic time source ([`Clock`]) and the CPU and RAM ceilings
//! ([`ResourceProbe`]) that resolve the "0 means automatic" budgets.
//!
//! # Budget Resolution
//!
//! Budgets are resolved once, when a facade iterator is created:
//!
//! | requested | effective                                  |
//! |-----------|--------------------------------------------|
//! | cpu = 0   | `schedulable_cpus()`                       |
//! | ram = 0   | `ram_budget_share * available_ram_bytes()` |
//! | otherwise | as requested                               |

pub mod clock;
pub mod resources;

pub use clock::{Clock, ClockRef, ManualClock, MonotonicClock};
pub use resources::{ProbeRef, ResourceProbe, StaticResources, SystemResources};

use crate::error::{AutotuneError, Result};
use serde::{Deserialize, Serialize};

/// Effective CPU and RAM budgets handed to the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    /// Total parallelism the tuned parameters may claim
    pub cpu: i64,
    /// Total bytes the tuned buffers may hold
    pub ram: i64,
}

impl Budgets {
    pub fn new(cpu: i64, ram: i64) -> Self {
        Self { cpu, ram }
    }

    /// Resolve requested budgets against the host.
    ///
    /// Negative requests are rejected with a configuration error.
    pub fn resolve(
        cpu_budget: i64,
        ram_budget: i64,
        probe: &dyn ResourceProbe,
        ram_budget_share: f64,
    ) -> Result<Self> {
        validate_requested(cpu_budget, ram_budget)?;

        let cpu = if cpu_budget == 0 {
            probe.schedulable_cpus().max(1)
        } else {
            cpu_budget
        };

        let ram = if ram_budget == 0 {
            let available = probe.available_ram_bytes() as f64;
            (ram_budget_share * available).min(i64::MAX as f64) as i64
        } else {
            ram_budget
        };

        tracing::debug!(
            requested_cpu = cpu_budget,
            requested_ram = ram_budget,
            cpu,
            ram,
            "resolved autotune budgets"
        );

        Ok(Self { cpu, ram })
    }
}

/// Reject negative budget requests.
pub fn validate_requested(cpu_budget: i64, ram_budget: i64) -> Result<()> {
    if cpu_budget < 0 {
        return Err(AutotuneError::Configuration(format!(
            "CPU budget must be positive but is {}.",
            cpu_budget
        )));
    }
    if ram_budget < 0 {
        return Err(AutotuneError::Configuration(format!(
            "RAM budget must be positive but is {}.",
            ram_budget
        )));
    }
    Ok(())
}
