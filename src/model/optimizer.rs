//! Parameter search over a [`ModelSnapshot`].
//!
//! Both strategies read a snapshot and return a new [`ParameterVector`];
//! neither touches the live parameters. The caller commits the result.
//!
//! # Budgets
//!
//! A vector is *feasible* when
//!
//! - the sum of tunable `parallelism` slots is at most the CPU budget, and
//! - the total maximum buffered bytes is at most the RAM budget.
//!
//! Every vector returned by [`Optimizer::step`] is integral, within each
//! slot's `[min, max]` and feasible.
//!
//! # Hill Climb
//!
//! Starts from the current values, or the minimums when the current values
//! are not feasible. Each round tries `+1` on every slot and keeps the move
//! with the largest improvement in root output time, ties going to the slot
//! earliest in pre-order. Growing a `buffer_size` must beat a minimum gain.
//! The climb ends when the output time drops below
//! `total_processing_time / cpu_budget`, every slot is at max, or no move
//! improves.
//!
//! # Gradient Descent
//!
//! Starts from the minimums and takes normalized steps along the negative
//! gradient, projecting back into the budgets after each step, until the
//! output time changes by less than the precision. The result is rounded,
//! falling back to flooring when rounding leaves the budgets.

use super::snapshot::{ModelSnapshot, ParameterVector};
use crate::config::{AutotuneAlgorithm, OptimizerSettings};
use crate::host::Budgets;
use thiserror::Error;

/// Upper bound on hill-climb rounds per `step`.
const MAX_HILL_CLIMB_STEPS: usize = 100_000;

/// Why an optimization left the parameters unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerWarning {
    #[error("invalid budgets: cpu {cpu}, ram {ram}")]
    InvalidBudget { cpu: i64, ram: i64 },

    #[error("model input time {0} is not a finite non-negative number")]
    InvalidInputTime(f64),

    #[error("output time estimate is not finite")]
    NonFiniteEstimate,

    #[error("minimum parameter values exceed the budgets (parallelism {parallelism}, bytes {bytes})")]
    InfeasibleMinimum { parallelism: f64, bytes: f64 },

    #[error("optimizer panicked: {0}")]
    Panicked(String),
}

/// A configured search strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimizer {
    HillClimb {
        buffer_size_min_delta_ns: f64,
    },
    GradientDescent {
        step: f64,
        precision_ns: f64,
        max_iterations: u32,
    },
}

impl Optimizer {
    pub fn new(algorithm: AutotuneAlgorithm, settings: &OptimizerSettings) -> Self {
        match algorithm {
            AutotuneAlgorithm::HillClimb => Optimizer::HillClimb {
                buffer_size_min_delta_ns: settings.buffer_size_min_delta_ns,
            },
            AutotuneAlgorithm::GradientDescent => Optimizer::GradientDescent {
                step: settings.descent_step,
                precision_ns: settings.descent_precision_ns,
                max_iterations: settings.descent_max_iterations,
            },
        }
    }

    pub fn algorithm(&self) -> AutotuneAlgorithm {
        match self {
            Optimizer::HillClimb { .. } => AutotuneAlgorithm::HillClimb,
            Optimizer::GradientDescent { .. } => AutotuneAlgorithm::GradientDescent,
        }
    }

    /// Search for a better parameter vector.
    pub fn step(
        &self,
        snapshot: &ModelSnapshot,
        budgets: &Budgets,
        model_input_time: f64,
    ) -> Result<ParameterVector, OptimizerWarning> {
        if budgets.cpu <= 0 || budgets.ram < 0 {
            return Err(OptimizerWarning::InvalidBudget {
                cpu: budgets.cpu,
                ram: budgets.ram,
            });
        }
        if !(model_input_time.is_finite() && model_input_time >= 0.0) {
            return Err(OptimizerWarning::InvalidInputTime(model_input_time));
        }

        let search = Search {
            snapshot,
            cpu: budgets.cpu as f64,
            ram: budgets.ram as f64,
            model_input_time,
        };
        match *self {
            Optimizer::HillClimb {
                buffer_size_min_delta_ns,
            } => search.hill_climb(buffer_size_min_delta_ns),
            Optimizer::GradientDescent {
                step,
                precision_ns,
                max_iterations,
            } => search.gradient_descent(step, precision_ns, max_iterations),
        }
    }
}

struct Search<'a> {
    snapshot: &'a ModelSnapshot,
    cpu: f64,
    ram: f64,
    model_input_time: f64,
}

impl Search<'_> {
    fn feasible(&self, values: &[f64]) -> bool {
        self.snapshot.total_parallelism(values) <= self.cpu
            && self.snapshot.total_maximum_buffered_bytes(values) <= self.ram
    }

    fn output_time(&self, values: &[f64]) -> Result<f64, OptimizerWarning> {
        let output = self.snapshot.output_time(values, self.model_input_time);
        if output.is_finite() {
            Ok(output)
        } else {
            Err(OptimizerWarning::NonFiniteEstimate)
        }
    }

    fn infeasible_minimum(&self, minimum: &[f64]) -> OptimizerWarning {
        OptimizerWarning::InfeasibleMinimum {
            parallelism: self.snapshot.total_parallelism(minimum),
            bytes: self.snapshot.total_maximum_buffered_bytes(minimum),
        }
    }

    fn hill_climb(&self, buffer_size_min_delta_ns: f64) -> Result<ParameterVector, OptimizerWarning> {
        let slots = self.snapshot.slots();
        let mut values = self.snapshot.current_values();
        if !self.feasible(&values) {
            let minimum = self.snapshot.minimum_values();
            if !self.feasible(&minimum) {
                return Err(self.infeasible_minimum(&minimum));
            }
            tracing::debug!("current parameters exceed the budgets, climbing from minimums");
            values = minimum;
        }

        let target = self.snapshot.total_processing_time() / self.cpu;
        for _ in 0..MAX_HILL_CLIMB_STEPS {
            let output = self.output_time(&values)?;
            if output < target {
                break;
            }

            let mut best: Option<(usize, f64)> = None;
            for (s, slot) in slots.iter().enumerate() {
                if values[s] >= slot.max as f64 {
                    continue;
                }
                values[s] += 1.0;
                if self.feasible(&values) {
                    let delta = output - self.output_time(&values)?;
                    let threshold = if slot.is_buffer_size() {
                        buffer_size_min_delta_ns
                    } else {
                        0.0
                    };
                    if delta > threshold && best.map_or(true, |(_, d)| delta > d) {
                        best = Some((s, delta));
                    }
                }
                values[s] -= 1.0;
            }

            match best {
                Some((s, _)) => values[s] += 1.0,
                None => break,
            }
        }
        Ok(values)
    }

    fn gradient_descent(
        &self,
        step: f64,
        precision_ns: f64,
        max_iterations: u32,
    ) -> Result<ParameterVector, OptimizerWarning> {
        let slots = self.snapshot.slots();
        let minimum = self.snapshot.minimum_values();
        if !self.feasible(&minimum) {
            return Err(self.infeasible_minimum(&minimum));
        }

        let mut values = minimum.clone();
        let mut previous = 0.0;
        for _ in 0..max_iterations {
            let (output, gradients) = self
                .snapshot
                .output_time_with_gradients(&values, self.model_input_time);
            if !output.is_finite() || gradients.iter().any(|g| !g.is_finite()) {
                return Err(OptimizerWarning::NonFiniteEstimate);
            }
            if (previous - output).abs() < precision_ns {
                break;
            }
            previous = output;

            let scale = slots
                .iter()
                .zip(&values)
                .zip(&gradients)
                .filter(|((slot, v), _)| **v < slot.max as f64)
                .map(|(_, g)| g.abs())
                .fold(1.0, f64::max);
            for (s, slot) in slots.iter().enumerate() {
                let next = values[s] - step * gradients[s] / scale;
                values[s] = next.clamp(slot.min as f64, slot.max as f64);
            }
            self.project(&mut values, &minimum);
        }

        let rounded: ParameterVector = values
            .iter()
            .zip(slots)
            .map(|(v, slot)| v.round().clamp(slot.min as f64, slot.max as f64))
            .collect();
        if self.feasible(&rounded) {
            return Ok(rounded);
        }
        let floored: ParameterVector = values
            .iter()
            .zip(slots)
            .map(|(v, slot)| v.floor().clamp(slot.min as f64, slot.max as f64))
            .collect();
        if self.feasible(&floored) {
            Ok(floored)
        } else {
            Ok(minimum)
        }
    }

    /// Shrink `values` toward `minimum` until both budgets hold.
    fn project(&self, values: &mut [f64], minimum: &[f64]) {
        let slots = self.snapshot.slots();

        let total = self.snapshot.total_parallelism(values);
        if total > self.cpu {
            let base = self.snapshot.total_parallelism(minimum);
            let excess = total - base;
            let scale = if excess > 0.0 {
                ((self.cpu - base) / excess).max(0.0)
            } else {
                0.0
            };
            for (s, slot) in slots.iter().enumerate() {
                if slot.is_parallelism() {
                    values[s] = minimum[s] + (values[s] - minimum[s]) * scale;
                }
            }
        }

        let bytes = self.snapshot.total_maximum_buffered_bytes(values);
        if bytes > self.ram {
            let costs: Vec<f64> = (0..slots.len())
                .map(|s| self.snapshot.buffer_cost(s))
                .collect();
            let excess: f64 = costs
                .iter()
                .enumerate()
                .map(|(s, c)| c * (values[s] - minimum[s]))
                .sum();
            let base = bytes - excess;
            let scale = if excess > 0.0 {
                ((self.ram - base) / excess).max(0.0)
            } else {
                0.0
            };
            for (s, cost) in costs.iter().enumerate() {
                if *cost > 0.0 {
                    values[s] = minimum[s] + (values[s] - minimum[s]) * scale;
                }
            }
        }
    }
}
