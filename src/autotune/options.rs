//! Construction options of the autotune facade.

use crate::config::{AutotuneAlgorithm, AutotuneConfig, OptimizerSettings};
use crate::host::ProbeRef;
use crate::metrics::SinkRef;

/// What to tune with, and within which budgets.
///
/// Budgets of 0 are resolved against the host when the iterator is built:
/// all schedulable CPUs, and `ram_budget_share` of the available RAM.
#[derive(Clone, Default)]
pub struct AutotuneOptions {
    pub algorithm: AutotuneAlgorithm,
    pub cpu_budget: i64,
    pub ram_budget: i64,
    pub optimizer: OptimizerSettings,
    /// Receives a report after every optimization cycle
    pub sink: Option<SinkRef>,
    /// Host ceilings; the running system when unset
    pub probe: Option<ProbeRef>,
}

impl AutotuneOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_algorithm(mut self, algorithm: AutotuneAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_cpu_budget(mut self, cpu_budget: i64) -> Self {
        self.cpu_budget = cpu_budget;
        self
    }

    pub fn with_ram_budget(mut self, ram_budget: i64) -> Self {
        self.ram_budget = ram_budget;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerSettings) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_sink(mut self, sink: SinkRef) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_probe(mut self, probe: ProbeRef) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl From<&AutotuneConfig> for AutotuneOptions {
    fn from(config: &AutotuneConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            cpu_budget: config.cpu_budget,
            ram_budget: config.ram_budget,
            optimizer: config.optimizer.clone(),
            sink: None,
            probe: None,
        }
    }
}

impl std::fmt::Debug for AutotuneOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutotuneOptions")
            .field("algorithm", &self.algorithm)
            .field("cpu_budget", &self.cpu_budget)
            .field("ram_budget", &self.ram_budget)
            .field("optimizer", &self.optimizer)
            .field("sink", &self.sink.is_some())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = AutotuneConfig::from_toml_str(
            r#"
            algorithm = "gradient_descent"
            cpu_budget = 3
            ram_budget = 4096
            "#,
        )
        .unwrap();
        let options = AutotuneOptions::from(&config);
        assert_eq!(options.algorithm, AutotuneAlgorithm::GradientDescent);
        assert_eq!(options.cpu_budget, 3);
        assert_eq!(options.ram_budget, 4096);
        assert!(options.sink.is_none());
    }

    #[test]
    fn test_builder_defaults() {
        let options = AutotuneOptions::new().with_cpu_budget(2);
        assert_eq!(options.algorithm, AutotuneAlgorithm::HillClimb);
        assert_eq!(options.cpu_budget, 2);
        assert_eq!(options.ram_budget, 0);
        assert!(format!("{:?}", options).contains("cpu_budget: 2"));
    }
}
