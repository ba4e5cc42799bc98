//! The pipeline model: a tree of nodes plus the machinery to tune it.
//!
//! A [`Model`] owns the root of the node tree. Operators register their
//! nodes through [`Model::add_node`] while the pipeline is built, and the
//! autotune controller periodically calls [`Model::optimize`], which
//! snapshots the tree under a read lock, searches without holding any lock,
//! and commits the result under the write lock. Operators read their
//! parameters through the shared atomics and never take the model lock.

use super::id::NodeId;
use super::node::{Node, NodeBuilder};
use super::optimizer::{Optimizer, OptimizerWarning};
use super::snapshot::ModelSnapshot;
use crate::config::{AutotuneAlgorithm, OptimizerSettings};
use crate::error::{AutotuneError, Result};
use crate::host::Budgets;
use crate::metrics::{MetricsReport, NodeMetrics, OptimizerStats, SinkRef};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct ModelState {
    root: Option<Arc<Node>>,
    next_id: u32,
}

/// What a call to [`Model::optimize`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizeOutcome {
    /// New values were written; `changed` parameters moved.
    Committed { changed: usize },
    /// Nothing to do: no root yet or no RAM to spend.
    Skipped,
    /// The search gave up and left every parameter as it was.
    Warning(OptimizerWarning),
}

/// Performance model of one pipeline.
pub struct Model {
    state: RwLock<ModelState>,
    settings: OptimizerSettings,
    sink: Option<SinkRef>,
    stats: OptimizerStats,
}

impl Model {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            state: RwLock::new(ModelState::default()),
            settings,
            sink: None,
            stats: OptimizerStats::default(),
        }
    }

    /// Attach a sink that receives every [`Model::flush_metrics`] report.
    pub fn with_sink(mut self, sink: SinkRef) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a node with the next id and attach it below `parent`.
    ///
    /// The first node added becomes the root; every later node needs a
    /// parent.
    pub fn add_node(&self, parent: Option<&Arc<Node>>, builder: NodeBuilder) -> Result<Arc<Node>> {
        let mut state = self.write();
        if parent.is_none() {
            if let Some(root) = &state.root {
                return Err(AutotuneError::Configuration(format!(
                    "model already has root {}; new nodes need a parent",
                    root.long_name()
                )));
            }
        }
        let node = Arc::new(builder.build(NodeId(state.next_id))?);
        if let Some(parent) = parent {
            parent.add_input(node.clone())?;
            tracing::trace!("Adding {} as input for {}", node.long_name(), parent.long_name());
        }
        state.next_id += 1;
        if state.root.is_none() {
            tracing::trace!("Setting {} as model root", node.long_name());
            state.root = Some(node.clone());
        }
        Ok(node)
    }

    pub fn root(&self) -> Option<Arc<Node>> {
        self.read().root.clone()
    }

    /// Number of nodes created so far.
    pub fn num_nodes(&self) -> usize {
        self.read().next_id as usize
    }

    /// Copy the current tree; empty before the first node is added.
    pub fn snapshot(&self) -> ModelSnapshot {
        let state = self.read();
        state
            .root
            .as_deref()
            .map(ModelSnapshot::capture)
            .unwrap_or_default()
    }

    /// Search for better parameter values and commit them.
    ///
    /// Never fails: anything that stops the search is counted as a warning
    /// and leaves the parameters untouched.
    pub fn optimize(
        &self,
        algorithm: AutotuneAlgorithm,
        cpu_budget: i64,
        ram_budget: i64,
        model_input_time_ns: f64,
    ) -> OptimizeOutcome {
        let _cycle = self.stats.begin_cycle();

        if ram_budget == 0 {
            tracing::debug!("RAM budget is 0, skipping optimization");
            return OptimizeOutcome::Skipped;
        }
        self.stats.set_cpu_budget(cpu_budget);

        let snapshot = {
            let state = self.read();
            match state.root.as_deref() {
                Some(root) => ModelSnapshot::capture(root),
                None => return OptimizeOutcome::Skipped,
            }
        };

        let optimizer = Optimizer::new(algorithm, &self.settings);
        let budgets = Budgets::new(cpu_budget, ram_budget);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            optimizer.step(&snapshot, &budgets, model_input_time_ns)
        }))
        .unwrap_or_else(|payload| Err(OptimizerWarning::Panicked(panic_message(payload))));

        let values = match result {
            Ok(values) => values,
            Err(warning) => {
                self.stats.record_warning();
                tracing::warn!("Skipping {} optimization: {}", algorithm, warning);
                return OptimizeOutcome::Warning(warning);
            }
        };

        let _state = self.write();
        let mut changed = 0;
        for (slot, value) in snapshot.slots().iter().zip(&values) {
            let previous = slot.handle.load();
            let stored = slot.handle.store(value.round() as i64);
            if stored != previous {
                changed += 1;
                tracing::debug!(
                    "Setting {}.{} from {} to {}",
                    snapshot.nodes()[slot.node].long_name,
                    slot.name,
                    previous,
                    stored
                );
            }
        }
        OptimizeOutcome::Committed { changed }
    }

    /// Current value of every parameter, keyed `long_name.parameter`, in pre-order.
    pub fn parameter_vector(&self) -> Vec<(String, i64)> {
        let state = self.read();
        let mut out = Vec::new();
        if let Some(root) = state.root.as_deref() {
            collect_parameters(root, &mut out);
        }
        out
    }

    /// Optimizations that were abandoned with a warning.
    pub fn optimizer_warnings(&self) -> u64 {
        self.stats.warnings()
    }

    /// Calls to [`Model::optimize`], including skipped ones.
    pub fn optimizations(&self) -> u64 {
        self.stats.cycles()
    }

    /// Consumer time between requests, as last measured by the facade.
    pub fn record_observed_input_time(&self, input_time_ns: u64) {
        self.stats.set_observed_input_time(input_time_ns);
    }

    /// Build a report of the current statistics.
    pub fn report(&self) -> MetricsReport {
        let snapshot = self.snapshot();
        let current = snapshot.current_values();
        let total_processing_time_ns = snapshot.total_processing_time();
        let cpu = self.stats.last_cpu_budget();

        let nodes = snapshot
            .nodes()
            .iter()
            .map(|n| NodeMetrics {
                name: n.long_name.clone(),
                kind: n.kind.label().to_string(),
                autotune: n.in_scope,
                processing_time_ns: n.processing_time_ns,
                num_elements: n.num_elements,
                bytes_produced: n.bytes_produced,
                bytes_consumed: n.bytes_consumed,
                buffered_bytes: n.buffered_bytes,
                buffered_elements: n.buffered_elements,
                parameters: n
                    .parameters
                    .iter()
                    .map(|p| (p.name.clone(), p.value))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect();

        MetricsReport {
            timestamp: chrono::Utc::now(),
            root_output_time_ns: snapshot.output_time(&current, 0.0),
            total_processing_time_ns,
            optimal_output_time_ns: (cpu > 0).then(|| total_processing_time_ns / cpu as f64),
            observed_input_time_ns: self.stats.observed_input_time_ns(),
            total_buffered_bytes: snapshot.total_buffered_bytes(),
            total_maximum_buffered_bytes: snapshot.total_maximum_buffered_bytes(&current),
            optimizations: self.stats.cycles(),
            optimizer_warnings: self.stats.warnings(),
            optimize_time: self.stats.cycle_time(),
            nodes,
        }
    }

    /// Hand a fresh report to the sink, if one is attached.
    pub fn flush_metrics(&self) {
        if let Some(sink) = &self.sink {
            sink.flush(&self.report());
        }
    }

    /// Multi-line dump of the whole tree.
    pub fn debug_string(&self) -> String {
        self.root().map(|r| r.debug_string()).unwrap_or_default()
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new(OptimizerSettings::default())
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("nodes", &self.num_nodes())
            .field("optimizations", &self.optimizations())
            .field("warnings", &self.optimizer_warnings())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

fn collect_parameters(node: &Node, out: &mut Vec<(String, i64)>) {
    for parameter in node.parameters() {
        out.push((
            format!("{}.{}", node.long_name(), parameter.name()),
            parameter.load(),
        ));
    }
    for input in node.inputs() {
        collect_parameters(&input, out);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
