//! Telemetry primitives and the metrics sink.
//!
//! The model keeps a handful of lock-free counters and hands a
//! [`MetricsReport`] to a [`MetricsSink`] whenever the controller flushes.
//! Two sinks ship with the crate: [`TracingSink`] logs each report as JSON
//! and [`MemorySink`] keeps the latest one for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Running totals kept by a model across calls to `optimize`.
///
/// All fields are relaxed atomics; readers only ever need a recent value.
#[derive(Debug, Default)]
pub struct OptimizerStats {
    cycles: AtomicU64,
    warnings: AtomicU64,
    observed_input_time_ns: AtomicU64,
    last_cpu_budget: AtomicU64,
    timed_cycles: AtomicU64,
    total_cycle_ns: AtomicU64,
    slowest_cycle_ns: AtomicU64,
}

impl OptimizerStats {
    /// Count a new cycle; its duration is recorded when the guard drops.
    pub fn begin_cycle(&self) -> CycleGuard<'_> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        CycleGuard {
            started: Instant::now(),
            stats: self,
        }
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_observed_input_time(&self, input_time_ns: u64) {
        self.observed_input_time_ns
            .store(input_time_ns, Ordering::Relaxed);
    }

    /// Remember the budget of the last cycle that had a positive one.
    pub fn set_cpu_budget(&self, cpu_budget: i64) {
        if cpu_budget > 0 {
            self.last_cpu_budget
                .store(cpu_budget as u64, Ordering::Relaxed);
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn observed_input_time_ns(&self) -> u64 {
        self.observed_input_time_ns.load(Ordering::Relaxed)
    }

    /// 0 until a cycle ran with a positive budget.
    pub fn last_cpu_budget(&self) -> u64 {
        self.last_cpu_budget.load(Ordering::Relaxed)
    }

    pub fn cycle_time(&self) -> CycleTime {
        CycleTime {
            cycles: self.timed_cycles.load(Ordering::Relaxed),
            total_ns: self.total_cycle_ns.load(Ordering::Relaxed),
            slowest_ns: self.slowest_cycle_ns.load(Ordering::Relaxed),
        }
    }

    fn record_cycle_time(&self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.timed_cycles.fetch_add(1, Ordering::Relaxed);
        self.total_cycle_ns.fetch_add(ns, Ordering::Relaxed);
        self.slowest_cycle_ns.fetch_max(ns, Ordering::Relaxed);
    }
}

/// Open optimization cycle; see [`OptimizerStats::begin_cycle`].
pub struct CycleGuard<'a> {
    started: Instant,
    stats: &'a OptimizerStats,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.stats.record_cycle_time(self.started.elapsed());
    }
}

/// Wall time spent inside `optimize`, skipped cycles included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTime {
    pub cycles: u64,
    pub total_ns: u64,
    pub slowest_ns: u64,
}

impl CycleTime {
    pub fn mean_ns(&self) -> u64 {
        self.total_ns.checked_div(self.cycles).unwrap_or(0)
    }
}

// ==================== Reports ====================

/// Flushed statistics of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub name: String,
    pub kind: String,
    pub autotune: bool,
    pub processing_time_ns: u64,
    pub num_elements: u64,
    pub bytes_produced: u64,
    pub bytes_consumed: u64,
    pub buffered_bytes: i64,
    pub buffered_elements: i64,
    pub parameters: BTreeMap<String, i64>,
}

/// Everything a flush exports, in pre-order of the node tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    /// Predicted time between root outputs at the current parameters
    pub root_output_time_ns: f64,
    /// CPU time per root output across the tree
    pub total_processing_time_ns: f64,
    /// `total_processing_time_ns / cpu_budget` of the last optimization
    pub optimal_output_time_ns: Option<f64>,
    /// Consumer time between requests measured by the facade
    pub observed_input_time_ns: u64,
    pub total_buffered_bytes: f64,
    pub total_maximum_buffered_bytes: f64,
    pub optimizations: u64,
    pub optimizer_warnings: u64,
    pub optimize_time: CycleTime,
    pub nodes: Vec<NodeMetrics>,
}

impl MetricsReport {
    /// Value of `node.parameter`, matching either the short or long node name.
    pub fn parameter(&self, node: &str, parameter: &str) -> Option<i64> {
        self.nodes
            .iter()
            .find(|n| n.name == node || n.name.starts_with(&format!("{}(", node)))
            .and_then(|n| n.parameters.get(parameter).copied())
    }
}

/// Destination of flushed reports.
pub trait MetricsSink: Send + Sync {
    fn flush(&self, report: &MetricsReport);
}

/// Shared handle to a sink.
pub type SinkRef = Arc<dyn MetricsSink>;

/// Logs every report as JSON at `debug` on the `pipeline_autotune::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn flush(&self, report: &MetricsReport) {
        match serde_json::to_string(report) {
            Ok(json) => tracing::debug!(target: "pipeline_autotune::metrics", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize metrics report: {}", e),
        }
    }
}

/// Keeps the most recent report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    latest: Mutex<Option<MetricsReport>>,
    flushes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self) -> Option<MetricsReport> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl MetricsSink for MemorySink {
    fn flush(&self, report: &MetricsReport) {
        *self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
