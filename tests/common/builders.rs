//! Test data builders for creating pipelines and options

use pipeline_autotune::ops::{ParallelMap, Range};
use pipeline_autotune::prelude::*;
use std::time::Duration;

/// Builder for a source whose per-element cost sits in a parallel map
pub struct SlowSourceBuilder {
    elements: i64,
    cost: Duration,
    max_parallelism: i64,
}

impl SlowSourceBuilder {
    pub fn new() -> Self {
        Self {
            elements: 100,
            cost: Duration::from_millis(10),
            max_parallelism: 8,
        }
    }

    pub fn elements(mut self, elements: i64) -> Self {
        self.elements = elements;
        self
    }

    pub fn cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    pub fn max_parallelism(mut self, max_parallelism: i64) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn build(self) -> ParallelMap<Range, i64> {
        let cost = self.cost;
        Range::new(0, self.elements)
            .parallel_map(move |x| {
                std::thread::sleep(cost);
                Ok(x)
            })
            .with_max_parallelism(self.max_parallelism)
    }
}

impl Default for SlowSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Options with explicit budgets and the given algorithm
pub fn budgeted_options(algorithm: AutotuneAlgorithm, cpu: i64, ram: i64) -> AutotuneOptions {
    AutotuneOptions::new()
        .with_algorithm(algorithm)
        .with_cpu_budget(cpu)
        .with_ram_budget(ram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_source_builder() {
        let ctx = IteratorContext::default();
        let dataset = SlowSourceBuilder::new()
            .elements(3)
            .cost(Duration::from_millis(1))
            .build();
        let mut it = dataset.make_iterator(&ctx).unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(0));
    }
}
