//! Per-operator performance model.
//!
//! Every operator of a tuned pipeline is represented by a [`Node`]. A node
//! carries the operator's tunable parameters, statistics gathered while the
//! operator runs, and a [`NodeKind`] that says how the operator turns input
//! time into output time.
//!
//! # Statistics
//!
//! All counters are relaxed atomics written from operator threads without
//! any lock. Processing time is attributed with [`Node::record_start`] and
//! [`Node::record_stop`], which pair up per calling thread, so several
//! worker threads can time the same node concurrently.
//!
//! # Ratios
//!
//! Ratios count *input elements consumed per output element*. A batch of
//! `N` is `KnownRatio(N)`, a one-to-one map is `KnownRatio(1)`, and a source
//! is ratio 0.

use super::id::NodeId;
use super::parameter::ParamRef;
use super::snapshot::ModelSnapshot;
use crate::error::{AutotuneError, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Start stamps of in-flight `record_start` calls on this thread, keyed by node uid.
    static WORK_START: RefCell<HashMap<u64, u64>> = RefCell::new(HashMap::new());
}

/// How a node's output time depends on its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NodeKind {
    /// Leaf producing elements without consuming any
    #[default]
    Source,
    /// Synchronous, consuming a fixed number of inputs per output
    KnownRatio(f64),
    /// Synchronous, ratio estimated from the first input's element count
    UnknownRatio,
    /// Pass-through whose cost is entirely its inputs'
    Unknown,
    /// Asynchronous with a buffer, consuming a fixed number of inputs per output
    Async(f64),
    /// Interleaves the derived inputs; the first input only seeds them
    InterleaveMany,
    /// Asynchronous interleave over the derived inputs
    AsyncInterleaveMany,
}

impl NodeKind {
    pub fn is_async(&self) -> bool {
        matches!(self, NodeKind::Async(_) | NodeKind::AsyncInterleaveMany)
    }

    /// Short tag used in reports
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::KnownRatio(_) => "known_ratio",
            NodeKind::UnknownRatio => "unknown_ratio",
            NodeKind::Unknown => "unknown",
            NodeKind::Async(_) => "async",
            NodeKind::InterleaveMany => "interleave_many",
            NodeKind::AsyncInterleaveMany => "async_interleave_many",
        }
    }
}

/// Raw statistics of a node.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub processing_time_ns: AtomicU64,
    pub num_elements: AtomicU64,
    pub bytes_produced: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub buffered_bytes: AtomicI64,
    pub buffered_elements: AtomicI64,
}

/// Describes a node before a model assigns it an id.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: String,
    kind: NodeKind,
    parameters: Vec<ParamRef>,
    autotune: bool,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters: Vec::new(),
            autotune: true,
        }
    }

    pub fn parameter(mut self, parameter: ParamRef) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn autotune(mut self, autotune: bool) -> Self {
        self.autotune = autotune;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the node with the given id.
    ///
    /// Fails if two parameters share a name or a ratio is negative or not finite.
    pub fn build(self, id: NodeId) -> Result<Node> {
        if let NodeKind::KnownRatio(r) | NodeKind::Async(r) = self.kind {
            if !(r.is_finite() && r >= 0.0) {
                return Err(AutotuneError::Configuration(format!(
                    "node '{}' has invalid ratio {}",
                    self.name, r
                )));
            }
        }

        let mut parameters = BTreeMap::new();
        for parameter in self.parameters {
            let name = parameter.name().to_string();
            if parameters.insert(name.clone(), parameter).is_some() {
                return Err(AutotuneError::Configuration(format!(
                    "node '{}' declares parameter '{}' twice",
                    self.name, name
                )));
            }
        }

        Ok(Node {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            id,
            name: self.name,
            kind: self.kind,
            parameters,
            autotune: AtomicBool::new(self.autotune),
            stats: NodeStats::default(),
            inputs: RwLock::new(Vec::new()),
            attached: AtomicBool::new(false),
        })
    }
}

/// Performance model of one operator.
pub struct Node {
    uid: u64,
    id: NodeId,
    name: String,
    kind: NodeKind,
    parameters: BTreeMap<String, ParamRef>,
    autotune: AtomicBool,
    stats: NodeStats,
    inputs: RwLock<Vec<Arc<Node>>>,
    attached: AtomicBool,
}

impl Node {
    /// A node outside of any model, for operators running untuned.
    pub fn detached(builder: NodeBuilder) -> Result<Arc<Node>> {
        builder.build(NodeId::INVALID).map(Arc::new)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `name(id:N)`, unique within a model.
    pub fn long_name(&self) -> String {
        format!("{}(id:{})", self.name, self.id)
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn autotune(&self) -> bool {
        self.autotune.load(Ordering::Relaxed)
    }

    /// Exclude (or re-include) this node and its subtree from estimation.
    pub fn set_autotune(&self, autotune: bool) {
        self.autotune.store(autotune, Ordering::Relaxed);
    }

    pub fn parameter(&self, name: &str) -> Option<ParamRef> {
        self.parameters.get(name).cloned()
    }

    /// Parameters in name order.
    pub fn parameters(&self) -> impl Iterator<Item = &ParamRef> {
        self.parameters.values()
    }

    pub fn has_tunable_parameters(&self) -> bool {
        self.parameters.values().any(|p| p.is_tunable())
    }

    pub fn inputs(&self) -> Vec<Arc<Node>> {
        self.inputs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Attach `input` as the next child. A node may have at most one parent.
    pub(crate) fn add_input(&self, input: Arc<Node>) -> Result<()> {
        if std::ptr::eq(self, Arc::as_ptr(&input)) {
            return Err(AutotuneError::Configuration(format!(
                "{} cannot be its own input",
                self.long_name()
            )));
        }
        if input.attached.swap(true, Ordering::AcqRel) {
            return Err(AutotuneError::Configuration(format!(
                "{} already has a parent",
                input.long_name()
            )));
        }
        self.inputs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(input);
        Ok(())
    }

    // ==================== Recording ====================

    /// Mark the start of work on the calling thread.
    pub fn record_start(&self, time_ns: u64) {
        WORK_START.with(|starts| {
            starts.borrow_mut().insert(self.uid, time_ns);
        });
    }

    /// Close the calling thread's open interval and add its length.
    ///
    /// A stop without a matching start, or one that would be negative,
    /// adds nothing.
    pub fn record_stop(&self, time_ns: u64) {
        let start = WORK_START.with(|starts| starts.borrow_mut().remove(&self.uid));
        if let Some(start) = start {
            self.add_processing_time(time_ns.saturating_sub(start));
        }
    }

    pub fn add_processing_time(&self, delta_ns: u64) {
        self.stats
            .processing_time_ns
            .fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn record_element(&self) {
        self.stats.num_elements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_produced(&self, bytes: u64) {
        self.stats.bytes_produced.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_consumed(&self, bytes: u64) {
        self.stats.bytes_consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Track an element entering (positive deltas) or leaving a buffer.
    pub fn record_buffer_event(&self, bytes_delta: i64, elements_delta: i64) {
        self.stats
            .buffered_bytes
            .fetch_add(bytes_delta, Ordering::Relaxed);
        self.stats
            .buffered_elements
            .fetch_add(elements_delta, Ordering::Relaxed);
    }

    // ==================== Observation ====================

    /// Accumulated processing time in nanoseconds.
    pub fn processing_time(&self) -> u64 {
        self.stats.processing_time_ns.load(Ordering::Relaxed)
    }

    pub fn num_elements(&self) -> u64 {
        self.stats.num_elements.load(Ordering::Relaxed)
    }

    pub fn bytes_produced(&self) -> u64 {
        self.stats.bytes_produced.load(Ordering::Relaxed)
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.stats.bytes_consumed.load(Ordering::Relaxed)
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.stats.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn buffered_elements(&self) -> i64 {
        self.stats.buffered_elements.load(Ordering::Relaxed)
    }

    /// Mean processing time per produced element, 0 before the first element.
    pub fn self_processing_time(&self) -> f64 {
        self_processing_time(self.processing_time(), self.num_elements())
    }

    /// Estimated size of one buffered element.
    pub fn average_buffered_element_size(&self) -> f64 {
        average_buffered_element_size(
            self.num_elements(),
            self.bytes_produced(),
            self.buffered_bytes(),
            self.buffered_elements(),
        )
    }

    /// Predicted time between outputs, given the consumer's time between requests.
    pub fn output_time(&self, input_time_ns: f64) -> f64 {
        let snapshot = ModelSnapshot::capture(self);
        snapshot.output_time(&snapshot.current_values(), input_time_ns)
    }

    /// CPU time spent in this subtree per produced element.
    pub fn total_processing_time(&self) -> f64 {
        ModelSnapshot::capture(self).total_processing_time()
    }

    /// Bytes currently held by buffers in this subtree.
    pub fn total_buffered_bytes(&self) -> f64 {
        ModelSnapshot::capture(self).total_buffered_bytes()
    }

    /// Bytes this subtree's buffers may hold at current parameter values.
    pub fn total_maximum_buffered_bytes(&self) -> f64 {
        let snapshot = ModelSnapshot::capture(self);
        snapshot.total_maximum_buffered_bytes(&snapshot.current_values())
    }

    /// Multi-line dump of this subtree's statistics.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        self.write_debug(&mut out, 0);
        out
    }

    fn write_debug(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;

        let pad = "  ".repeat(depth);
        let inputs = self.inputs();
        let _ = writeln!(out, "{}{}:", pad, self.long_name());
        let _ = writeln!(out, "{}  autotune={}", pad, self.autotune());
        let _ = writeln!(out, "{}  buffered_bytes={}", pad, self.buffered_bytes());
        let _ = writeln!(
            out,
            "{}  buffered_elements={}",
            pad,
            self.buffered_elements()
        );
        let _ = writeln!(out, "{}  bytes_consumed={}", pad, self.bytes_consumed());
        let _ = writeln!(out, "{}  bytes_produced={}", pad, self.bytes_produced());
        let _ = writeln!(out, "{}  processing_time={}", pad, self.processing_time());
        let _ = writeln!(out, "{}  num_elements={}", pad, self.num_elements());
        for parameter in self.parameters() {
            let _ = writeln!(out, "{}  {}={}", pad, parameter.name(), parameter.load());
        }
        let names: Vec<String> = inputs.iter().map(|i| i.long_name()).collect();
        let _ = writeln!(out, "{}  inputs={{{}}}", pad, names.join(","));
        for input in &inputs {
            input.write_debug(out, depth + 1);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("autotune", &self.autotune())
            .field("num_elements", &self.num_elements())
            .field("processing_time", &self.processing_time())
            .finish()
    }
}

pub(crate) fn self_processing_time(processing_time_ns: u64, num_elements: u64) -> f64 {
    if num_elements == 0 {
        0.0
    } else {
        processing_time_ns as f64 / num_elements as f64
    }
}

pub(crate) fn average_buffered_element_size(
    num_elements: u64,
    bytes_produced: u64,
    buffered_bytes: i64,
    buffered_elements: i64,
) -> f64 {
    let produced = (num_elements > 0).then(|| bytes_produced as f64 / num_elements as f64);
    let buffered = (buffered_elements > 0 && buffered_bytes >= 0)
        .then(|| buffered_bytes as f64 / buffered_elements as f64);
    match (produced, buffered) {
        (None, None) => 0.0,
        (Some(p), None) => p,
        (None, Some(b)) => b,
        (Some(p), Some(b)) => (p + b) / 2.0,
    }
}
