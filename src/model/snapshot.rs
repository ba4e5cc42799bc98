//! Frozen view of a node tree for estimation and optimization.
//!
//! A [`ModelSnapshot`] copies every node's statistics and parameter values
//! into a flat pre-order array, so a subtree is always a contiguous range and
//! a node's descendants come after it. Tunable parameters are flattened in
//! the same order into *slots*; a [`ParameterVector`] assigns one value per
//! slot and is what the optimizers search over.
//!
//! # Estimation
//!
//! Estimation runs in two passes over the array:
//!
//! 1. **Input times**, root to leaves: the time between requests a node
//!    sees from its consumer, derived from the parent's input time.
//! 2. **Output times**, leaves to root: the time a node needs per output
//!    element given its inputs' output times. The same pass optionally
//!    accumulates the gradient of the root's output time with respect to
//!    every slot.
//!
//! Nodes with autotuning disabled, along with their subtrees, take no part
//! in either pass and contribute no slots.

use super::id::NodeId;
use super::node::{average_buffered_element_size, self_processing_time, Node, NodeKind};
use super::parameter::{ParamRef, BUFFER_SIZE, PARALLELISM};
use super::wait_time::compute_wait_time;
use std::ops::Range;

/// One value per tunable slot of a [`ModelSnapshot`].
pub type ParameterVector = Vec<f64>;

/// Captured state of one parameter.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    pub name: String,
    pub value: i64,
    pub min: i64,
    pub max: i64,
    /// Index into the parameter vector when the optimizer may move it
    pub slot: Option<usize>,
}

/// Captured state of one node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub long_name: String,
    pub kind: NodeKind,
    /// Takes part in estimation
    pub in_scope: bool,
    pub parent: Option<usize>,
    pub inputs: Vec<usize>,
    /// One past the last node of this subtree
    pub subtree_end: usize,
    /// Slots owned by this node
    pub own_slots: Range<usize>,
    /// One past the last slot of this subtree
    pub subtree_slots_end: usize,
    pub parameters: Vec<ParamSnapshot>,
    pub processing_time_ns: u64,
    pub num_elements: u64,
    pub bytes_produced: u64,
    pub bytes_consumed: u64,
    pub buffered_bytes: i64,
    pub buffered_elements: i64,
}

impl NodeSnapshot {
    pub fn self_processing_time(&self) -> f64 {
        self_processing_time(self.processing_time_ns, self.num_elements)
    }

    pub fn average_buffered_element_size(&self) -> f64 {
        average_buffered_element_size(
            self.num_elements,
            self.bytes_produced,
            self.buffered_bytes,
            self.buffered_elements,
        )
    }

    fn parameter(&self, name: &str) -> Option<&ParamSnapshot> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// `buffer_size` if present, else `parallelism`.
    fn buffer_parameter(&self) -> Option<&ParamSnapshot> {
        self.parameter(BUFFER_SIZE)
            .or_else(|| self.parameter(PARALLELISM))
    }
}

/// A tunable parameter exposed to the optimizer.
#[derive(Debug, Clone)]
pub struct TunableSlot {
    /// Index of the owning node
    pub node: usize,
    pub name: String,
    pub min: i64,
    pub max: i64,
    /// Value at capture time
    pub value: i64,
    pub(crate) handle: ParamRef,
}

impl TunableSlot {
    pub fn is_parallelism(&self) -> bool {
        self.name == PARALLELISM
    }

    pub fn is_buffer_size(&self) -> bool {
        self.name == BUFFER_SIZE
    }
}

/// Flat pre-order copy of a node tree.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    nodes: Vec<NodeSnapshot>,
    slots: Vec<TunableSlot>,
}

impl ModelSnapshot {
    /// Copy the tree rooted at `root`.
    pub fn capture(root: &Node) -> Self {
        let mut snapshot = ModelSnapshot::default();
        snapshot.visit(root, None, true);
        snapshot
    }

    fn visit(&mut self, node: &Node, parent: Option<usize>, parent_in_scope: bool) -> usize {
        let index = self.nodes.len();
        let in_scope = parent_in_scope && (parent.is_none() || node.autotune());
        let tunable_scope = in_scope && node.autotune();

        let slots_start = self.slots.len();
        let mut parameters = Vec::new();
        for parameter in node.parameters() {
            let value = parameter.load();
            let slot = (tunable_scope && parameter.is_tunable() && parameter.min() < parameter.max())
                .then(|| {
                    self.slots.push(TunableSlot {
                        node: index,
                        name: parameter.name().to_string(),
                        min: parameter.min(),
                        max: parameter.max(),
                        value,
                        handle: parameter.clone(),
                    });
                    self.slots.len() - 1
                });
            parameters.push(ParamSnapshot {
                name: parameter.name().to_string(),
                value,
                min: parameter.min(),
                max: parameter.max(),
                slot,
            });
        }
        let own_slots = slots_start..self.slots.len();

        self.nodes.push(NodeSnapshot {
            id: node.id(),
            long_name: node.long_name(),
            kind: node.kind(),
            in_scope,
            parent,
            inputs: Vec::new(),
            subtree_end: index + 1,
            own_slots,
            subtree_slots_end: self.slots.len(),
            parameters,
            processing_time_ns: node.processing_time(),
            num_elements: node.num_elements(),
            bytes_produced: node.bytes_produced(),
            bytes_consumed: node.bytes_consumed(),
            buffered_bytes: node.buffered_bytes(),
            buffered_elements: node.buffered_elements(),
        });

        let mut inputs = Vec::new();
        for input in node.inputs() {
            inputs.push(self.visit(&input, Some(index), in_scope));
        }

        let subtree_end = self.nodes.len();
        let subtree_slots_end = self.slots.len();
        let entry = &mut self.nodes[index];
        entry.inputs = inputs;
        entry.subtree_end = subtree_end;
        entry.subtree_slots_end = subtree_slots_end;
        index
    }

    pub fn nodes(&self) -> &[NodeSnapshot] {
        &self.nodes
    }

    pub fn slots(&self) -> &[TunableSlot] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parameter values as captured.
    pub fn current_values(&self) -> ParameterVector {
        self.slots.iter().map(|s| s.value as f64).collect()
    }

    /// Every slot at its minimum.
    pub fn minimum_values(&self) -> ParameterVector {
        self.slots.iter().map(|s| s.min as f64).collect()
    }

    /// Predicted time between root outputs.
    pub fn output_time(&self, values: &[f64], model_input_time: f64) -> f64 {
        Pass::new(self, values, false).run(model_input_time)
    }

    /// Predicted root output time and its gradient with respect to every slot.
    pub fn output_time_with_gradients(
        &self,
        values: &[f64],
        model_input_time: f64,
    ) -> (f64, Vec<f64>) {
        let mut pass = Pass::new(self, values, true);
        let output_time = pass.run(model_input_time);
        (output_time, pass.gradients.unwrap_or_default())
    }

    /// CPU time spent in the tree per root output element.
    pub fn total_processing_time(&self) -> f64 {
        let mut totals = vec![0.0; self.nodes.len()];
        for i in (0..self.nodes.len()).rev() {
            let node = &self.nodes[i];
            if !node.in_scope {
                continue;
            }
            let spt = node.self_processing_time();
            let sum: f64 = self.in_scope_inputs(i).map(|c| totals[c]).sum();
            let total = match node.kind {
                NodeKind::Source => spt,
                NodeKind::KnownRatio(r) | NodeKind::Async(r) => {
                    if r == 0.0 {
                        spt
                    } else {
                        spt + r * sum
                    }
                }
                NodeKind::UnknownRatio => match self.observed_ratio(i) {
                    Some(ratio) => spt + ratio * sum,
                    None => spt,
                },
                NodeKind::Unknown => sum,
                NodeKind::InterleaveMany | NodeKind::AsyncInterleaveMany => {
                    let n = node.inputs.len();
                    if n <= 1 {
                        spt
                    } else {
                        let first = self.first_input_value(i, &totals);
                        spt + (sum - first) / (n - 1) as f64
                    }
                }
            };
            totals[i] = total;
        }
        totals.first().copied().unwrap_or(0.0)
    }

    /// Bytes held right now by buffers of in-scope nodes.
    pub fn total_buffered_bytes(&self) -> f64 {
        self.nodes
            .iter()
            .filter(|n| n.in_scope && n.buffer_parameter().is_some())
            .map(|n| n.buffered_bytes as f64)
            .sum()
    }

    /// Bytes all in-scope buffers may hold under `values`.
    pub fn total_maximum_buffered_bytes(&self, values: &[f64]) -> f64 {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].in_scope)
            .map(|i| self.maximum_buffered_bytes(i, values))
            .sum()
    }

    fn maximum_buffered_bytes(&self, i: usize, values: &[f64]) -> f64 {
        let node = &self.nodes[i];
        match node.kind {
            NodeKind::Async(r) => match node.buffer_parameter() {
                Some(p) => {
                    let bytes = self.value_of(p, values) * node.average_buffered_element_size();
                    if r == 0.0 {
                        bytes
                    } else {
                        bytes / r
                    }
                }
                None => 0.0,
            },
            NodeKind::AsyncInterleaveMany => match node.parameter(PARALLELISM) {
                Some(p) => self.value_of(p, values) * node.average_buffered_element_size(),
                None => 0.0,
            },
            _ => 0.0,
        }
    }

    /// Bytes one unit of `slot` adds to the maximum buffered bytes.
    pub fn buffer_cost(&self, slot: usize) -> f64 {
        let Some(s) = self.slots.get(slot) else {
            return 0.0;
        };
        let node = &self.nodes[s.node];
        match node.kind {
            NodeKind::Async(r) => {
                let counts = node
                    .buffer_parameter()
                    .is_some_and(|p| p.slot == Some(slot));
                if !counts {
                    0.0
                } else if r == 0.0 {
                    node.average_buffered_element_size()
                } else {
                    node.average_buffered_element_size() / r
                }
            }
            NodeKind::AsyncInterleaveMany if s.is_parallelism() => {
                node.average_buffered_element_size()
            }
            _ => 0.0,
        }
    }

    /// Sum of tunable `parallelism` values under `values`.
    ///
    /// This is the quantity held to the CPU budget. A fixed `parallelism` is
    /// set by whoever built the pipeline and still feeds the output-time
    /// estimate, but the optimizer cannot lower it, so it is left out of
    /// the sum.
    pub fn total_parallelism(&self, values: &[f64]) -> f64 {
        self.slots
            .iter()
            .zip(values)
            .filter(|(s, _)| s.is_parallelism())
            .map(|(_, v)| *v)
            .sum()
    }

    fn value_of(&self, parameter: &ParamSnapshot, values: &[f64]) -> f64 {
        match parameter.slot {
            Some(slot) => values.get(slot).copied().unwrap_or(parameter.value as f64),
            None => parameter.value as f64,
        }
    }

    fn in_scope_inputs(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.nodes[i]
            .inputs
            .iter()
            .copied()
            .filter(|&c| self.nodes[c].in_scope)
    }

    fn first_input_value(&self, i: usize, per_node: &[f64]) -> f64 {
        match self.nodes[i].inputs.first() {
            Some(&c) if self.nodes[c].in_scope => per_node[c],
            _ => 0.0,
        }
    }

    /// Inputs consumed per output, as observed; `None` until both sides have produced.
    fn observed_ratio(&self, i: usize) -> Option<f64> {
        let node = &self.nodes[i];
        let first = node.inputs.first().map(|&c| &self.nodes[c])?;
        if node.num_elements == 0 || first.num_elements == 0 {
            return None;
        }
        Some(first.num_elements as f64 / node.num_elements as f64)
    }
}

/// One estimation pass over a snapshot.
struct Pass<'a> {
    snapshot: &'a ModelSnapshot,
    values: &'a [f64],
    input_times: Vec<f64>,
    output_times: Vec<f64>,
    /// d(output time) / d(input time) per node
    output_time_gradients: Vec<f64>,
    gradients: Option<Vec<f64>>,
}

impl<'a> Pass<'a> {
    fn new(snapshot: &'a ModelSnapshot, values: &'a [f64], with_gradients: bool) -> Self {
        let n = snapshot.nodes.len();
        Self {
            snapshot,
            values,
            input_times: vec![0.0; n],
            output_times: vec![0.0; n],
            output_time_gradients: vec![0.0; n],
            gradients: with_gradients.then(|| vec![0.0; snapshot.slots.len()]),
        }
    }

    fn run(&mut self, model_input_time: f64) -> f64 {
        let snapshot = self.snapshot;
        let n = snapshot.nodes.len();
        for i in 0..n {
            let node = &snapshot.nodes[i];
            if !node.in_scope {
                continue;
            }
            let inherited = node
                .parent
                .map(|p| self.input_times[p])
                .unwrap_or(model_input_time);
            self.input_times[i] = self.input_time(i, inherited);
        }
        for i in (0..n).rev() {
            if snapshot.nodes[i].in_scope {
                self.output_time(i);
            }
        }
        self.output_times.first().copied().unwrap_or(0.0)
    }

    fn param(&self, i: usize, name: &str) -> Option<(f64, Option<usize>)> {
        self.snapshot.nodes[i]
            .parameter(name)
            .map(|p| (self.snapshot.value_of(p, self.values), p.slot))
    }

    fn input_time(&self, i: usize, inherited: f64) -> f64 {
        let node = &self.snapshot.nodes[i];
        let spt = node.self_processing_time();
        match node.kind {
            NodeKind::Source | NodeKind::Unknown => inherited,
            NodeKind::KnownRatio(r) => {
                if r == 0.0 {
                    inherited
                } else {
                    (inherited + spt) / r
                }
            }
            NodeKind::UnknownRatio => match self.snapshot.observed_ratio(i) {
                Some(ratio) => (inherited + spt) / ratio,
                None => inherited,
            },
            NodeKind::InterleaveMany | NodeKind::AsyncInterleaveMany => {
                let n = node.inputs.len();
                if n <= 1 {
                    inherited
                } else {
                    (inherited + spt) * (n - 1) as f64
                }
            }
            NodeKind::Async(r) => {
                let parallelism = self.param(i, PARALLELISM).map_or(1.0, |(v, _)| v);
                let base = inherited + spt / parallelism;
                if r == 0.0 {
                    base
                } else {
                    base / r
                }
            }
        }
    }

    fn sum_outputs(&self, i: usize) -> f64 {
        self.snapshot
            .in_scope_inputs(i)
            .map(|c| self.output_times[c])
            .sum()
    }

    fn sum_output_time_gradients(&self, i: usize) -> f64 {
        self.snapshot
            .in_scope_inputs(i)
            .map(|c| self.output_time_gradients[c])
            .sum()
    }

    fn descendant_slots(&self, i: usize) -> Range<usize> {
        let node = &self.snapshot.nodes[i];
        node.own_slots.end..node.subtree_slots_end
    }

    fn scale_descendants(&mut self, i: usize, factor: f64) {
        let range = self.descendant_slots(i);
        if let Some(gradients) = self.gradients.as_mut() {
            gradients[range].iter_mut().for_each(|g| *g *= factor);
        }
    }

    fn zero_descendants(&mut self, i: usize) {
        self.scale_descendants(i, 0.0);
    }

    /// Zero every slot in the subtree rooted at input `c`, own slots included.
    fn zero_subtree(&mut self, c: usize) {
        let node = &self.snapshot.nodes[c];
        let range = node.own_slots.start..node.subtree_slots_end;
        if let Some(gradients) = self.gradients.as_mut() {
            gradients[range].iter_mut().for_each(|g| *g = 0.0);
        }
    }

    fn set_gradient(&mut self, slot: Option<usize>, value: f64) {
        if let (Some(slot), Some(gradients)) = (slot, self.gradients.as_mut()) {
            gradients[slot] = value;
        }
    }

    fn output_time(&mut self, i: usize) {
        let snapshot = self.snapshot;
        let node = &snapshot.nodes[i];
        let spt = node.self_processing_time();
        let num_inputs = node.inputs.len();
        let first_input = node.inputs.first().copied();

        let output = match node.kind {
            NodeKind::Source => {
                self.zero_descendants(i);
                spt
            }
            NodeKind::KnownRatio(r) => self.scaled_output(i, spt, (r != 0.0).then_some(r)),
            NodeKind::UnknownRatio => {
                let ratio = self.snapshot.observed_ratio(i);
                self.scaled_output(i, spt, ratio)
            }
            NodeKind::Unknown => {
                self.output_time_gradients[i] = self.sum_output_time_gradients(i);
                self.sum_outputs(i)
            }
            NodeKind::InterleaveMany => {
                if num_inputs <= 1 {
                    self.zero_descendants(i);
                    spt
                } else {
                    let cycle = (num_inputs - 1) as f64;
                    let first_out = self.snapshot.first_input_value(i, &self.output_times);
                    let first_otg = self
                        .snapshot
                        .first_input_value(i, &self.output_time_gradients);
                    let inputs_output_time = (self.sum_outputs(i) - first_out) / cycle;
                    self.scale_descendants(i, 1.0 / cycle);
                    self.output_time_gradients[i] = self.sum_output_time_gradients(i) - first_otg;
                    if let Some(first) = first_input {
                        self.zero_subtree(first);
                    }
                    spt + inputs_output_time
                }
            }
            NodeKind::AsyncInterleaveMany => {
                if num_inputs <= 1 {
                    self.zero_descendants(i);
                    spt
                } else {
                    let cycle = (num_inputs - 1) as f64;
                    let consumer_time = self.input_times[i] / cycle;
                    let own = self.param(i, PARALLELISM);
                    let parallelism = own.map_or(cycle, |(v, _)| cycle.min(v));
                    let first_out = self.snapshot.first_input_value(i, &self.output_times);
                    let producer_time = (self.sum_outputs(i) - first_out) / cycle / parallelism;
                    let w = compute_wait_time(producer_time, consumer_time, parallelism);

                    if self.gradients.is_some() {
                        let otg_sum = self.sum_output_time_gradients(i);
                        self.output_time_gradients[i] =
                            w.d_consumer + w.d_producer * otg_sum / parallelism;
                        self.scale_descendants(i, w.d_producer / cycle / parallelism);
                        if let Some(first) = first_input {
                            self.zero_subtree(first);
                        }
                        if let Some((_, slot)) = own {
                            self.set_gradient(
                                slot,
                                w.d_buffer - w.d_producer * producer_time / parallelism,
                            );
                        }
                    }
                    spt + w.wait
                }
            }
            NodeKind::Async(r) => {
                let par = self.param(i, PARALLELISM);
                let buf = self.param(i, BUFFER_SIZE);
                let parallelism = par.map_or(1.0, |(v, _)| v);
                let buffer_size = match (par, buf) {
                    (Some((p, _)), _) => {
                        if r == 0.0 {
                            p
                        } else {
                            p / r
                        }
                    }
                    (None, Some((b, _))) => b,
                    (None, None) => 0.0,
                };
                let input_time = self.input_times[i];

                let (consumer_time, producer_time) = if r == 0.0 {
                    (input_time, 0.0)
                } else {
                    (input_time * r, r * self.sum_outputs(i))
                };
                let w = compute_wait_time(producer_time, consumer_time, buffer_size);

                if self.gradients.is_some() {
                    let otg_sum = if r == 0.0 {
                        0.0
                    } else {
                        self.sum_output_time_gradients(i)
                    };
                    self.output_time_gradients[i] = w.d_consumer + w.d_producer * otg_sum;
                    if r == 0.0 {
                        self.zero_descendants(i);
                    } else {
                        self.scale_descendants(i, r * w.d_producer);
                    }
                    let spt_term = (1.0 + w.d_consumer + w.d_producer * otg_sum) * spt
                        / (parallelism * parallelism);
                    match (par, buf) {
                        (Some((_, slot @ Some(_))), _) => {
                            let d_buffer = if r == 0.0 { w.d_buffer } else { w.d_buffer / r };
                            self.set_gradient(slot, d_buffer - spt_term);
                        }
                        (_, Some((_, slot @ Some(_)))) => self.set_gradient(slot, w.d_buffer),
                        _ => {}
                    }
                }
                spt / parallelism + w.wait
            }
        };
        self.output_times[i] = output;
    }

    /// Output of a synchronous node consuming `ratio` inputs per output.
    fn scaled_output(&mut self, i: usize, spt: f64, ratio: Option<f64>) -> f64 {
        match ratio {
            None => {
                self.zero_descendants(i);
                spt
            }
            Some(ratio) => {
                self.scale_descendants(i, ratio);
                self.output_time_gradients[i] = self.sum_output_time_gradients(i);
                spt + ratio * self.sum_outputs(i)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::NodeBuilder;
    use crate::model::parameter::Parameter;
    use std::sync::Arc;

    fn build(id: u32, builder: NodeBuilder) -> Arc<Node> {
        Arc::new(builder.build(NodeId(id)).unwrap())
    }

    fn record(node: &Node, processing_time: u64, elements: u64) {
        node.add_processing_time(processing_time);
        for _ in 0..elements {
            node.record_element();
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9 * (1.0 + expected.abs()),
            "expected {} to equal {}",
            actual,
            expected
        );
    }

    #[test]
    fn test_source_output_time_is_self_time() {
        let source = build(0, NodeBuilder::new("source", NodeKind::Source));
        record(&source, 100, 1);
        assert_close(source.output_time(0.0), 100.0);
        assert_close(source.output_time(1_000.0), 100.0);
        assert_close(source.total_processing_time(), 100.0);
    }

    #[test]
    fn test_known_ratio_scales_inputs() {
        for ratio in [1.0, 2.0, 4.0, 8.0] {
            let batch = build(0, NodeBuilder::new("batch", NodeKind::KnownRatio(ratio)));
            let a = build(1, NodeBuilder::new("a", NodeKind::Source));
            let b = build(2, NodeBuilder::new("b", NodeKind::Source));
            batch.add_input(a.clone()).unwrap();
            batch.add_input(b.clone()).unwrap();
            record(&batch, 100, 1);
            record(&a, 50, 1);
            record(&b, 150, 1);
            // 100 + ratio * (50 + 150)
            assert_close(batch.output_time(0.0), 100.0 + ratio * 200.0);
            assert_close(batch.total_processing_time(), 100.0 + ratio * 200.0);
        }
    }

    #[test]
    fn test_unknown_ratio_uses_observed_counts() {
        let node = build(0, NodeBuilder::new("filter", NodeKind::UnknownRatio));
        let a = build(1, NodeBuilder::new("a", NodeKind::Source));
        node.add_input(a.clone()).unwrap();
        // No elements yet: ratio unknown, only self time counts.
        assert_close(node.output_time(0.0), 0.0);

        record(&node, 400, 2);
        record(&a, 300, 6);
        // ratio = 6 / 2 = 3; self 200; input self 50
        assert_close(node.output_time(0.0), 200.0 + 3.0 * 50.0);
        assert_close(node.total_processing_time(), 200.0 + 3.0 * 50.0);
    }

    #[test]
    fn test_unknown_passes_through() {
        let node = build(0, NodeBuilder::new("opaque", NodeKind::Unknown));
        let a = build(1, NodeBuilder::new("a", NodeKind::Source));
        let b = build(2, NodeBuilder::new("b", NodeKind::Source));
        node.add_input(a.clone()).unwrap();
        node.add_input(b.clone()).unwrap();
        record(&node, 1_000, 1);
        record(&a, 10, 1);
        record(&b, 20, 1);
        assert_close(node.output_time(0.0), 30.0);
        assert_close(node.total_processing_time(), 30.0);
    }

    #[test]
    fn test_interleave_many_excludes_first_input() {
        let node = build(0, NodeBuilder::new("interleave", NodeKind::InterleaveMany));
        let seed = build(1, NodeBuilder::new("seed", NodeKind::Source));
        let a = build(2, NodeBuilder::new("a", NodeKind::Source));
        let b = build(3, NodeBuilder::new("b", NodeKind::Source));
        for input in [&seed, &a, &b] {
            node.add_input((*input).clone()).unwrap();
        }
        record(&node, 100, 1);
        record(&seed, 10_000, 1);
        record(&a, 50, 1);
        record(&b, 150, 1);
        assert_close(node.output_time(0.0), 100.0 + (50.0 + 150.0) / 2.0);
    }

    #[test]
    fn test_autotune_disabled_subtree_is_excluded() {
        let root = build(0, NodeBuilder::new("root", NodeKind::KnownRatio(1.0)));
        let hidden = build(1, NodeBuilder::new("hidden", NodeKind::Source).autotune(false));
        root.add_input(hidden.clone()).unwrap();
        record(&root, 10, 1);
        record(&hidden, 1_000, 1);
        assert_close(root.output_time(0.0), 10.0);
        assert_close(root.total_processing_time(), 10.0);
    }

    fn async_map(parallelism: i64, max: i64) -> (Arc<Node>, Arc<Node>) {
        let map = build(
            0,
            NodeBuilder::new("map", NodeKind::Async(1.0))
                .parameter(Parameter::new(PARALLELISM, parallelism, 1, max).unwrap().shared()),
        );
        let source = build(1, NodeBuilder::new("source", NodeKind::Source));
        map.add_input(source.clone()).unwrap();
        (map, source)
    }

    #[test]
    fn test_async_parallelism_divides_self_time() {
        let (map, source) = async_map(4, 8);
        record(&map, 10_000, 1);
        record(&source, 0, 1);
        // Infinitely fast producer: no wait, output = self / parallelism.
        assert_close(map.output_time(0.0), 2_500.0);
    }

    #[test]
    fn test_snapshot_layout_is_pre_order() {
        let root = build(0, NodeBuilder::new("root", NodeKind::KnownRatio(1.0)));
        let (map, source) = async_map(1, 4);
        let _ = source;
        root.add_input(map).unwrap();
        let snapshot = ModelSnapshot::capture(&root);
        let names: Vec<&str> = snapshot
            .nodes()
            .iter()
            .map(|n| n.long_name.as_str())
            .collect();
        assert_eq!(names, ["root(id:0)", "map(id:0)", "source(id:1)"]);
        assert_eq!(snapshot.nodes()[0].subtree_end, 3);
        assert_eq!(snapshot.nodes()[1].subtree_end, 3);
        assert_eq!(snapshot.slots().len(), 1);
        assert_eq!(snapshot.slots()[0].node, 1);
        assert_eq!(snapshot.current_values(), vec![1.0]);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let root = build(0, NodeBuilder::new("root", NodeKind::KnownRatio(1.0)));
        let map = build(
            1,
            NodeBuilder::new("map", NodeKind::Async(1.0))
                .parameter(Parameter::new(PARALLELISM, 2, 1, 16).unwrap().shared()),
        );
        let prefetch = build(
            2,
            NodeBuilder::new("prefetch", NodeKind::Async(1.0))
                .parameter(Parameter::new(BUFFER_SIZE, 2, 0, 16).unwrap().shared()),
        );
        let source = build(3, NodeBuilder::new("source", NodeKind::Source));
        root.add_input(map.clone()).unwrap();
        map.add_input(prefetch.clone()).unwrap();
        prefetch.add_input(source.clone()).unwrap();
        record(&root, 300, 10);
        record(&map, 40_000, 10);
        record(&prefetch, 500, 10);
        record(&source, 9_000, 10);

        let snapshot = ModelSnapshot::capture(&root);
        let values = vec![2.5, 3.5];
        let (_, gradients) = snapshot.output_time_with_gradients(&values, 0.0);
        let h = 1e-5;
        for slot in 0..values.len() {
            let mut up = values.clone();
            let mut down = values.clone();
            up[slot] += h;
            down[slot] -= h;
            let numeric =
                (snapshot.output_time(&up, 0.0) - snapshot.output_time(&down, 0.0)) / (2.0 * h);
            assert!(
                (gradients[slot] - numeric).abs() < 1e-3 * (1.0 + numeric.abs()),
                "slot {}: analytic {} vs numeric {}",
                slot,
                gradients[slot],
                numeric
            );
        }
    }

    #[test]
    fn test_maximum_buffered_bytes() {
        let (map, source) = async_map(3, 8);
        record(&map, 0, 4);
        map.record_bytes_produced(400);
        record(&source, 0, 4);
        let snapshot = ModelSnapshot::capture(&map);
        // 3 slots * 100 bytes per element
        assert_close(snapshot.total_maximum_buffered_bytes(&[3.0]), 300.0);
        assert_close(snapshot.total_maximum_buffered_bytes(&[5.0]), 500.0);
        assert_close(snapshot.buffer_cost(0), 100.0);
        assert_close(snapshot.total_parallelism(&[5.0]), 5.0);
    }

    #[test]
    fn test_fixed_parallelism_is_outside_the_cpu_total() {
        let root = build(0, NodeBuilder::new("root", NodeKind::KnownRatio(1.0)));
        let pinned = build(
            1,
            NodeBuilder::new("pinned", NodeKind::Async(1.0))
                .parameter(Parameter::fixed(PARALLELISM, 6).shared()),
        );
        let (map, _source) = async_map(2, 8);
        root.add_input(pinned.clone()).unwrap();
        pinned.add_input(map).unwrap();

        let snapshot = ModelSnapshot::capture(&root);
        assert_eq!(snapshot.slots().len(), 1);
        assert_close(snapshot.total_parallelism(&[2.0]), 2.0);
        assert_close(snapshot.total_parallelism(&[8.0]), 8.0);
    }

    #[test]
    fn test_total_buffered_bytes_counts_buffering_nodes_only() {
        let (map, source) = async_map(3, 8);
        map.record_buffer_event(256, 2);
        source.record_buffer_event(1_000, 1);
        assert_close(map.total_buffered_bytes(), 256.0);
    }
}
