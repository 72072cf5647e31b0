use core::fmt;

#[cfg(feature = "serde")]
use std::collections::BTreeMap;
#[cfg(feature = "serde")]
use std::io::{Read, Write};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::trace;

use crate::error::{Error, Result};
use crate::prng::Prng;
use crate::ring::RingBuffer;
#[cfg(feature = "serde")]
use crate::storage::{self, GraphImage, NodeImage};

/// Type alias for node activations (non-negative after evaluation, raw on inputs).
pub type Activation = f32;

/// Type alias for edge weights.
pub type Weight = f32;

/// Dendrite weights are signed and clamped to `[-WEIGHT_LIMIT, WEIGHT_LIMIT]`.
pub const WEIGHT_LIMIT: Weight = 5.0;

/// Axon conduction range.
pub const CONDUCTION_MIN: Weight = 0.01;
pub const CONDUCTION_MAX: Weight = 1.0;

/// Skip-edge strength range.
pub const SKIP_MIN: Weight = 0.0;
pub const SKIP_MAX: Weight = 1.0;

/// Skip edges learn at this fraction of the caller's learning rate.
pub const SKIP_PLASTICITY: f32 = 0.01;

/// Upper bound on the short-term memory contribution to a node.
pub const MEMORY_TERM_CAP: f32 = 1.0;

/// Weight of a trace entry relative to the next newer one.
pub const TRACE_RECENCY: f32 = 0.7;

pub const SOFTMAX_EPSILON: f32 = 1e-8;

/// Global node identity.
///
/// Ids are contiguous per layer: inputs `[0,I)`, hidden `[I,I+H)`,
/// outputs `[I+H,I+H+O)`. Use [`Layout`] to classify an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Input,
    Hidden,
    Output,
}

/// Layer dimensions and the id arithmetic that goes with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout {
    pub input: usize,
    pub hidden: usize,
    pub output: usize,
}

impl Layout {
    #[must_use]
    pub fn total(&self) -> usize {
        self.input + self.hidden + self.output
    }

    #[must_use]
    pub fn input_id(&self, i: usize) -> NodeId {
        debug_assert!(i < self.input);
        NodeId(i as u32)
    }

    #[must_use]
    pub fn hidden_id(&self, j: usize) -> NodeId {
        debug_assert!(j < self.hidden);
        NodeId((self.input + j) as u32)
    }

    #[must_use]
    pub fn output_id(&self, k: usize) -> NodeId {
        debug_assert!(k < self.output);
        NodeId((self.input + self.hidden + k) as u32)
    }

    /// Layer and offset within that layer, or `None` for out-of-range ids.
    #[must_use]
    pub fn classify(&self, id: NodeId) -> Option<(Layer, usize)> {
        let i = id.index();
        if i < self.input {
            Some((Layer::Input, i))
        } else if i < self.input + self.hidden {
            Some((Layer::Hidden, i - self.input))
        } else if i < self.total() {
            Some((Layer::Output, i - self.input - self.hidden))
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.total()
    }

    #[must_use]
    pub fn hidden_offset(&self, id: NodeId) -> Option<usize> {
        match self.classify(id) {
            Some((Layer::Hidden, j)) => Some(j),
            _ => None,
        }
    }

    #[must_use]
    pub fn output_offset(&self, id: NodeId) -> Option<usize> {
        match self.classify(id) {
            Some((Layer::Output, k)) => Some(k),
            _ => None,
        }
    }

    pub fn hidden_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.hidden).map(move |j| self.hidden_id(j))
    }
}

/// Incoming weighted edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dendrite {
    pub source: NodeId,
    pub weight: Weight,
}

/// Outgoing edge; `conduction` scales the signal recorded for the pathway.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxonTerminal {
    pub target: NodeId,
    pub conduction: Weight,
}

/// Hidden→output edge that bypasses the dendrite sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipEdge {
    pub target: NodeId,
    pub strength: Weight,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub activation: Activation,
    /// Last few activations, oldest first.
    pub trace: RingBuffer<Activation>,
    pub dendrites: Vec<Dendrite>,
    pub axon_terminals: Vec<AxonTerminal>,
    pub skip_edges: Vec<SkipEdge>,
}

impl Node {
    fn new(id: NodeId, memory_depth: usize) -> Self {
        Self {
            id,
            activation: 0.0,
            trace: RingBuffer::new(memory_depth),
            dendrites: Vec::new(),
            axon_terminals: Vec::new(),
            skip_edges: Vec::new(),
        }
    }

    /// Recency-weighted mean of the trace (newest entry weighs 1, each older
    /// entry `TRACE_RECENCY` times the next newer one).
    #[must_use]
    pub fn memory_average(&self) -> f32 {
        let mut w = 1.0;
        let mut num = 0.0;
        let mut den = 0.0;
        for &a in self.trace.iter().rev() {
            num += w * a;
            den += w;
            w *= TRACE_RECENCY;
        }
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    }

    fn memory_term(&self, influence: f32) -> f32 {
        (influence * self.memory_average()).clamp(0.0, MEMORY_TERM_CAP)
    }

    /// Dense convention: dot product of source activations and weights.
    fn weighted_input(&self, acts: &[Activation]) -> f32 {
        self.dendrites
            .iter()
            .map(|d| acts[d.source.index()] * d.weight)
            .sum()
    }

    fn dense_value(&self, acts: &[Activation], influence: f32) -> Activation {
        self.weighted_input(acts).max(0.0) + self.memory_term(influence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GraphConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,

    /// Length of each node's activation trace (M).
    pub memory_depth: usize,
    /// Fraction of the trace average folded into a node's value.
    pub memory_influence: f32,

    /// Skip edges per hidden node, each to a distinct output.
    pub skip_edges_per_node: usize,

    /// Initial dendrite weights are uniform in `[-scale, scale]`.
    pub init_weight_scale: f32,

    /// Dense passes kept in the snapshot history.
    pub snapshot_capacity: usize,

    // If set, makes weight initialisation reproducible.
    pub seed: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            input_size: 32,
            hidden_size: 64,
            output_size: 10,
            memory_depth: 5,
            memory_influence: 0.1,
            skip_edges_per_node: 2,
            init_weight_scale: 0.5,
            snapshot_capacity: 16,
            seed: None,
        }
    }
}

impl GraphConfig {
    /// Maximum node count across all layers.
    pub const MAX_NODES: usize = 1 << 20;

    pub fn with_size(input_size: usize, hidden_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            hidden_size,
            output_size,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_memory(mut self, depth: usize, influence: f32) -> Self {
        self.memory_depth = depth;
        self.memory_influence = influence;
        self
    }

    pub fn with_skip_edges(mut self, per_node: usize) -> Self {
        self.skip_edges_per_node = per_node;
        self
    }

    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if self.input_size == 0 {
            return Err("input_size must be >= 1");
        }
        if self.hidden_size == 0 {
            return Err("hidden_size must be >= 1");
        }
        if self.output_size == 0 {
            return Err("output_size must be >= 1");
        }
        if self.input_size + self.hidden_size + self.output_size > Self::MAX_NODES {
            return Err("total node count too large");
        }
        if self.memory_depth == 0 {
            return Err("memory_depth must be >= 1");
        }
        if !self.memory_influence.is_finite()
            || self.memory_influence < 0.0
            || self.memory_influence > 1.0
        {
            return Err("memory_influence must be in [0, 1]");
        }
        if self.skip_edges_per_node > self.output_size {
            return Err("skip_edges_per_node must be <= output_size");
        }
        if !self.init_weight_scale.is_finite()
            || self.init_weight_scale <= 0.0
            || self.init_weight_scale > WEIGHT_LIMIT
        {
            return Err("init_weight_scale must be in (0, WEIGHT_LIMIT]");
        }
        if self.snapshot_capacity == 0 {
            return Err("snapshot_capacity must be >= 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout {
            input: self.input_size,
            hidden: self.hidden_size,
            output: self.output_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeState {
    pub id: NodeId,
    pub activation: Activation,
    pub trace: Vec<Activation>,
}

/// State of the whole graph after one dense pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkSnapshot {
    pub pass: u64,
    pub nodes: Vec<NodeState>,
    pub output: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GraphDiagnostics {
    pub node_count: usize,
    pub dendrite_count: usize,
    pub skip_edge_count: usize,
    pub dense_passes: u64,
    pub active_hidden: usize,
    pub avg_hidden_activation: f32,
}

pub struct ComputationGraph {
    cfg: GraphConfig,
    layout: Layout,

    inputs: Vec<Node>,
    hidden: Vec<Node>,
    outputs: Vec<Node>,

    snapshots: RingBuffer<NetworkSnapshot>,
    last_output: Vec<f32>,
    passes: u64,
}

impl ComputationGraph {
    pub fn new(cfg: GraphConfig) -> Result<Self> {
        cfg.validate().map_err(Error::Configuration)?;

        let layout = cfg.layout();
        let mut rng = Prng::new(cfg.seed.unwrap_or(1));
        let scale = cfg.init_weight_scale;

        let mut inputs: Vec<Node> = (0..layout.input)
            .map(|i| Node::new(layout.input_id(i), cfg.memory_depth))
            .collect();
        let mut hidden: Vec<Node> = (0..layout.hidden)
            .map(|j| Node::new(layout.hidden_id(j), cfg.memory_depth))
            .collect();
        let mut outputs: Vec<Node> = (0..layout.output)
            .map(|k| Node::new(layout.output_id(k), cfg.memory_depth))
            .collect();

        // Full connectivity between adjacent layers, dendrites in source order.
        for h in &mut hidden {
            for src in &mut inputs {
                let weight = rng.gen_range_f32(-scale, scale);
                h.dendrites.push(Dendrite {
                    source: src.id,
                    weight,
                });
                src.axon_terminals.push(AxonTerminal {
                    target: h.id,
                    conduction: conduction_for(weight),
                });
            }
        }
        for o in &mut outputs {
            for src in &mut hidden {
                let weight = rng.gen_range_f32(-scale, scale);
                o.dendrites.push(Dendrite {
                    source: src.id,
                    weight,
                });
                src.axon_terminals.push(AxonTerminal {
                    target: o.id,
                    conduction: conduction_for(weight),
                });
            }
        }

        // Skip edges to distinct outputs, sorted by target.
        for h in &mut hidden {
            let mut targets: Vec<usize> = (0..layout.output).collect();
            for slot in 0..cfg.skip_edges_per_node {
                let pick = rng.gen_range_usize(slot, targets.len());
                targets.swap(slot, pick);
            }
            let mut chosen = targets[..cfg.skip_edges_per_node].to_vec();
            chosen.sort_unstable();
            h.skip_edges = chosen
                .into_iter()
                .map(|k| SkipEdge {
                    target: layout.output_id(k),
                    strength: rng.gen_range_f32(0.01, 0.1),
                })
                .collect();
        }

        Ok(Self {
            cfg,
            layout,
            inputs,
            hidden,
            outputs,
            snapshots: RingBuffer::new(cfg.snapshot_capacity),
            last_output: Vec::new(),
            passes: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.cfg
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub fn dense_passes(&self) -> u64 {
        self.passes
    }

    /// Output of the most recent pass (dense or selective). Empty before the first pass.
    #[must_use]
    pub fn last_output(&self) -> &[f32] {
        &self.last_output
    }

    /// Dense-pass history, oldest first.
    pub fn snapshots(&self) -> impl Iterator<Item = &NetworkSnapshot> {
        self.snapshots.iter()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        match self.layout.classify(id)? {
            (Layer::Input, i) => self.inputs.get(i),
            (Layer::Hidden, j) => self.hidden.get(j),
            (Layer::Output, k) => self.outputs.get(k),
        }
    }

    pub fn activation(&self, id: NodeId) -> Option<Activation> {
        self.node(id).map(|n| n.activation)
    }

    pub fn input_nodes(&self) -> &[Node] {
        &self.inputs
    }

    pub fn hidden_nodes(&self) -> &[Node] {
        &self.hidden
    }

    pub fn output_nodes(&self) -> &[Node] {
        &self.outputs
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes().map(|n| n.dendrites.len() + n.skip_edges.len()).sum()
    }

    pub fn diagnostics(&self) -> GraphDiagnostics {
        let active_hidden = self.hidden.iter().filter(|n| n.activation > 0.0).count();
        let avg_hidden_activation =
            self.hidden.iter().map(|n| n.activation).sum::<f32>() / self.hidden.len() as f32;
        GraphDiagnostics {
            node_count: self.layout.total(),
            dendrite_count: self.nodes().map(|n| n.dendrites.len()).sum(),
            skip_edge_count: self.hidden.iter().map(|n| n.skip_edges.len()).sum(),
            dense_passes: self.passes,
            active_hidden,
            avg_hidden_activation,
        }
    }

    /// Full dense pass.
    ///
    /// Only the first `input.len()` input nodes are written; the rest keep the
    /// value from the previous pass. Appends one [`NetworkSnapshot`].
    pub fn forward(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.inject(input)?;
        let influence = self.cfg.memory_influence;

        let mut acts = self.activations();
        let hidden_values = self.evaluate_hidden(&acts);
        for (j, &v) in hidden_values.iter().enumerate() {
            acts[self.layout.hidden_id(j).index()] = v;
        }

        let (skip, sums) = self.output_stage(&acts, None);
        let output_values: Vec<Activation> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(k, o)| (sums[k] + skip[k]).max(0.0) + o.memory_term(influence))
            .collect();

        for (h, v) in self.hidden.iter_mut().zip(hidden_values) {
            h.activation = v;
            h.trace.push(v);
        }
        for (o, &v) in self.outputs.iter_mut().zip(&output_values) {
            o.activation = v;
            o.trace.push(v);
        }

        let probs = softmax(&output_values);
        self.passes = self.passes.wrapping_add(1);
        self.last_output.clone_from(&probs);
        self.record_snapshot();
        Ok(probs)
    }

    /// Pathway-restricted pass.
    ///
    /// Only hidden ids in `active` are evaluated. Each active node builds its
    /// dendrite signals as pre-weighted products (`activation × weight`) and
    /// sums them.
    ///
    /// Inactive hidden nodes are NOT recomputed: they keep the activation of
    /// the most recent prior pass. This stale-state reuse is an approximation
    /// of a sparse recomputation, not an exact one. Output nodes are always
    /// evaluated, but only active hidden sources and active skip-edge origins
    /// contribute to them.
    ///
    /// When `active` holds no hidden id (or the graph has no edges) this runs
    /// the dense pass and returns its output unchanged.
    pub fn selective_forward(&mut self, input: &[f32], active: &[NodeId]) -> Result<Vec<f32>> {
        if input.len() > self.layout.input {
            return Err(Error::InputSize {
                expected: self.layout.input,
                actual: input.len(),
            });
        }

        let mut mask = vec![false; self.layout.hidden];
        let mut any = false;
        for &id in active {
            if let Some(j) = self.layout.hidden_offset(id) {
                mask[j] = true;
                any = true;
            }
        }
        if !any || self.edge_count() == 0 {
            trace!(
                requested = active.len(),
                "no active hidden nodes; selective pass falls back to dense"
            );
            return self.forward(input);
        }

        self.inject(input)?;
        let influence = self.cfg.memory_influence;

        let mut acts = self.activations();
        let mut fresh: Vec<(usize, Activation)> = Vec::new();
        for (j, h) in self.hidden.iter().enumerate() {
            if !mask[j] {
                continue;
            }
            let signals: Vec<f32> = h
                .dendrites
                .iter()
                .map(|d| acts[d.source.index()] * d.weight)
                .collect();
            let v = signals.iter().sum::<f32>().max(0.0) + h.memory_term(influence);
            fresh.push((j, v));
        }
        for &(j, v) in &fresh {
            acts[self.layout.hidden_id(j).index()] = v;
        }

        let (skip, sums) = self.output_stage(&acts, Some(&mask));
        let output_values: Vec<Activation> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(k, o)| (sums[k] + skip[k]).max(0.0) + o.memory_term(influence))
            .collect();

        for (j, v) in fresh {
            let h = &mut self.hidden[j];
            h.activation = v;
            h.trace.push(v);
        }
        for (o, &v) in self.outputs.iter_mut().zip(&output_values) {
            o.activation = v;
            o.trace.push(v);
        }

        let probs = softmax(&output_values);
        self.last_output.clone_from(&probs);
        Ok(probs)
    }

    /// Dense pass followed by one gradient step. Returns the cross-entropy loss.
    pub fn train_step(&mut self, input: &[f32], target: usize, learning_rate: f32) -> Result<f32> {
        self.check_target(target)?;
        self.forward(input)?;
        self.backward(target, learning_rate)
    }

    /// Gradient step against the state left by the most recent pass.
    ///
    /// Output delta is `p - onehot(target)`; hidden deltas are gated by the
    /// ReLU derivative of the hidden activation. All weights are clamped
    /// afterwards and axon conduction is resynchronised.
    pub(crate) fn backward(&mut self, target: usize, learning_rate: f32) -> Result<f32> {
        self.check_target(target)?;
        if self.last_output.len() != self.layout.output {
            return Err(Error::Configuration(
                "backward requires a completed forward pass",
            ));
        }

        let acts = self.activations();
        let delta_out: Vec<f32> = self
            .last_output
            .iter()
            .enumerate()
            .map(|(k, &p)| if k == target { p - 1.0 } else { p })
            .collect();

        // Back-propagate through the pre-update output weights.
        let mut delta_hidden = vec![0.0f32; self.layout.hidden];
        for (k, o) in self.outputs.iter().enumerate() {
            for d in &o.dendrites {
                if let Some(j) = self.layout.hidden_offset(d.source) {
                    delta_hidden[j] += delta_out[k] * d.weight;
                }
            }
        }
        for (j, h) in self.hidden.iter().enumerate() {
            if h.activation <= 0.0 {
                delta_hidden[j] = 0.0;
            }
        }

        for (k, o) in self.outputs.iter_mut().enumerate() {
            for d in &mut o.dendrites {
                let grad = delta_out[k] * acts[d.source.index()];
                d.weight = (d.weight - learning_rate * grad).clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
            }
        }

        let skip_rate = learning_rate * SKIP_PLASTICITY;
        for h in &mut self.hidden {
            let a = h.activation;
            for e in &mut h.skip_edges {
                if let Some(k) = self.layout.output_offset(e.target) {
                    e.strength = (e.strength - skip_rate * delta_out[k] * a).clamp(SKIP_MIN, SKIP_MAX);
                }
            }
        }

        for (j, h) in self.hidden.iter_mut().enumerate() {
            for d in &mut h.dendrites {
                let grad = delta_hidden[j] * acts[d.source.index()];
                d.weight = (d.weight - learning_rate * grad).clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
            }
        }

        self.sync_conduction();

        let p = self.last_output[target];
        Ok(-(p + SOFTMAX_EPSILON).ln())
    }

    fn check_target(&self, target: usize) -> Result<()> {
        if target >= self.layout.output {
            return Err(Error::TargetOutOfRange {
                target,
                outputs: self.layout.output,
            });
        }
        Ok(())
    }

    fn inject(&mut self, input: &[f32]) -> Result<()> {
        if input.len() > self.layout.input {
            return Err(Error::InputSize {
                expected: self.layout.input,
                actual: input.len(),
            });
        }
        for (node, &x) in self.inputs.iter_mut().zip(input) {
            node.activation = x;
        }
        Ok(())
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.inputs
            .iter()
            .chain(self.hidden.iter())
            .chain(self.outputs.iter())
    }

    /// Activations indexed by `NodeId`.
    fn activations(&self) -> Vec<Activation> {
        self.nodes().map(|n| n.activation).collect()
    }

    fn evaluate_hidden(&self, acts: &[Activation]) -> Vec<Activation> {
        let influence = self.cfg.memory_influence;

        #[cfg(feature = "parallel")]
        {
            self.hidden
                .par_iter()
                .map(|h| h.dense_value(acts, influence))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            self.hidden
                .iter()
                .map(|h| h.dense_value(acts, influence))
                .collect()
        }
    }

    /// Skip averages and output dendrite sums, computed side by side.
    fn output_stage(&self, acts: &[Activation], mask: Option<&[bool]>) -> (Vec<f32>, Vec<f32>) {
        #[cfg(feature = "parallel")]
        {
            rayon::join(
                || self.skip_averages(acts, mask),
                || self.output_sums(acts, mask),
            )
        }

        #[cfg(not(feature = "parallel"))]
        {
            (self.skip_averages(acts, mask), self.output_sums(acts, mask))
        }
    }

    /// Mean of `origin_activation × strength` per output over the skip edges
    /// whose origin passes `mask`.
    fn skip_averages(&self, acts: &[Activation], mask: Option<&[bool]>) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.layout.output];
        let mut counts = vec![0u32; self.layout.output];
        for (j, h) in self.hidden.iter().enumerate() {
            if mask.is_some_and(|m| !m[j]) {
                continue;
            }
            let a = acts[h.id.index()];
            for e in &h.skip_edges {
                if let Some(k) = self.layout.output_offset(e.target) {
                    sums[k] += a * e.strength;
                    counts[k] += 1;
                }
            }
        }
        sums.iter()
            .zip(&counts)
            .map(|(&s, &c)| if c > 0 { s / c as f32 } else { 0.0 })
            .collect()
    }

    fn output_sums(&self, acts: &[Activation], mask: Option<&[bool]>) -> Vec<f32> {
        match mask {
            None => self.outputs.iter().map(|o| o.weighted_input(acts)).collect(),
            Some(mask) => self
                .outputs
                .iter()
                .map(|o| {
                    o.dendrites
                        .iter()
                        .map(|d| match self.layout.hidden_offset(d.source) {
                            Some(j) if !mask[j] => 0.0,
                            _ => acts[d.source.index()] * d.weight,
                        })
                        .sum()
                })
                .collect(),
        }
    }

    fn sync_conduction(&mut self) {
        let weights: Vec<Vec<Weight>> = self
            .nodes()
            .map(|n| n.dendrites.iter().map(|d| d.weight).collect())
            .collect();
        let sources: Vec<Vec<NodeId>> = self
            .nodes()
            .map(|n| n.dendrites.iter().map(|d| d.source).collect())
            .collect();

        for node in self.inputs.iter_mut().chain(self.hidden.iter_mut()) {
            let source = node.id;
            for t in &mut node.axon_terminals {
                let ti = t.target.index();
                let Some(pos) = find_source(&sources[ti], source) else {
                    continue;
                };
                t.conduction = conduction_for(weights[ti][pos]);
            }
        }
    }

    fn record_snapshot(&mut self) {
        let nodes = self
            .nodes()
            .map(|n| NodeState {
                id: n.id,
                activation: n.activation,
                trace: n.trace.to_vec(),
            })
            .collect();
        self.snapshots.push(NetworkSnapshot {
            pass: self.passes,
            nodes,
            output: self.last_output.clone(),
        });
    }
}

#[cfg(feature = "serde")]
impl ComputationGraph {
    /// Logical schema of the full graph state.
    pub fn to_image(&self) -> GraphImage {
        let nodes = self
            .nodes()
            .map(|n| NodeImage {
                id: n.id,
                activation: n.activation,
                trace: n.trace.to_vec(),
                dendrites: n.dendrites.iter().map(|d| (d.source, d.weight)).collect(),
                axon_terminals: n
                    .axon_terminals
                    .iter()
                    .map(|t| (t.target, t.conduction))
                    .collect(),
                skip_edges: n.skip_edges.iter().map(|e| (e.target, e.strength)).collect(),
            })
            .collect();

        GraphImage {
            schema: storage::SCHEMA_VERSION,
            config: self.cfg,
            passes: self.passes,
            last_output: self.last_output.clone(),
            nodes,
            snapshots: self.snapshots.to_vec(),
        }
    }

    /// Rebuild from a schema value, rejecting dangling edge endpoints.
    pub fn from_image(image: GraphImage) -> Result<Self> {
        if image.schema != storage::SCHEMA_VERSION {
            return Err(Error::persistence("unsupported graph schema version"));
        }
        let cfg = image.config;
        cfg.validate().map_err(Error::Configuration)?;
        let layout = cfg.layout();
        if image.nodes.len() != layout.total() {
            return Err(Error::persistence("node count mismatch"));
        }

        let mut inputs = Vec::with_capacity(layout.input);
        let mut hidden = Vec::with_capacity(layout.hidden);
        let mut outputs = Vec::with_capacity(layout.output);

        for (i, n) in image.nodes.into_iter().enumerate() {
            if n.id.index() != i {
                return Err(Error::persistence("node ids out of order"));
            }
            let endpoints_valid = |edges: &BTreeMap<NodeId, Weight>| {
                edges.keys().all(|id| layout.contains(*id))
            };
            if !endpoints_valid(&n.dendrites)
                || !endpoints_valid(&n.axon_terminals)
                || !endpoints_valid(&n.skip_edges)
            {
                return Err(Error::persistence("edge endpoint out of range"));
            }

            let node = Node {
                id: n.id,
                activation: n.activation,
                trace: RingBuffer::from_vec(cfg.memory_depth, n.trace),
                dendrites: n
                    .dendrites
                    .into_iter()
                    .map(|(source, weight)| Dendrite { source, weight })
                    .collect(),
                axon_terminals: n
                    .axon_terminals
                    .into_iter()
                    .map(|(target, conduction)| AxonTerminal { target, conduction })
                    .collect(),
                skip_edges: n
                    .skip_edges
                    .into_iter()
                    .map(|(target, strength)| SkipEdge { target, strength })
                    .collect(),
            };

            match layout.classify(node.id) {
                Some((Layer::Input, _)) => inputs.push(node),
                Some((Layer::Hidden, _)) => hidden.push(node),
                Some((Layer::Output, _)) => outputs.push(node),
                None => return Err(Error::persistence("node id out of range")),
            }
        }

        if !image.last_output.is_empty() && image.last_output.len() != layout.output {
            return Err(Error::persistence("last output length mismatch"));
        }

        Ok(Self {
            cfg,
            layout,
            inputs,
            hidden,
            outputs,
            snapshots: RingBuffer::from_vec(cfg.snapshot_capacity, image.snapshots),
            last_output: image.last_output,
            passes: image.passes,
        })
    }

    /// Serialize a versioned graph image (header + one `GRPH` chunk).
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        storage::write_header(w)?;
        storage::write_json_chunk(w, storage::GRAPH_TAG, &self.to_image())
    }

    /// Load a graph image. Unknown chunks are skipped.
    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        storage::read_header(r)?;
        let mut image: Option<GraphImage> = None;
        storage::for_each_chunk(r, |tag, payload| {
            if tag == storage::GRAPH_TAG {
                image = Some(storage::decode_json(payload)?);
            }
            Ok(())
        })?;
        let image = image.ok_or_else(|| Error::persistence("missing GRPH chunk"))?;
        Self::from_image(image)
    }

    /// Exact serialized size in bytes for the current graph image.
    pub fn image_size_bytes(&self) -> Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }
}

fn conduction_for(weight: Weight) -> Weight {
    weight.abs().clamp(CONDUCTION_MIN, CONDUCTION_MAX)
}

fn find_source(sources: &[NodeId], source: NodeId) -> Option<usize> {
    sources.iter().position(|&s| s == source)
}

/// Numerically stable softmax: subtract the max, add epsilon to the denominator.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|&v| (v - max).exp()).collect();
    let sum = exps.iter().sum::<f32>() + SOFTMAX_EPSILON;
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value (first on ties).
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map(|(_, b)| v > b).unwrap_or(true) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_graph(seed: u64) -> ComputationGraph {
        ComputationGraph::new(GraphConfig::with_size(8, 16, 4).with_seed(seed)).unwrap()
    }

    fn one_hot(n: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; n];
        v[i] = 1.0;
        v
    }

    fn assert_finite(values: &[f32]) {
        assert!(values.iter().all(|v| v.is_finite()), "non-finite value in {values:?}");
    }

    #[test]
    fn rejects_zero_dimensions() {
        for cfg in [
            GraphConfig::with_size(0, 4, 2),
            GraphConfig::with_size(4, 0, 2),
            GraphConfig::with_size(4, 4, 0),
        ] {
            assert!(matches!(
                ComputationGraph::new(cfg),
                Err(Error::Configuration(_))
            ));
        }
    }

    #[test]
    fn layout_partitions_ids() {
        let layout = GraphConfig::with_size(3, 4, 2).layout();
        assert_eq!(layout.classify(NodeId(0)), Some((Layer::Input, 0)));
        assert_eq!(layout.classify(NodeId(3)), Some((Layer::Hidden, 0)));
        assert_eq!(layout.classify(NodeId(6)), Some((Layer::Hidden, 3)));
        assert_eq!(layout.classify(NodeId(7)), Some((Layer::Output, 0)));
        assert_eq!(layout.classify(NodeId(9)), None);
        assert_eq!(layout.hidden_ids().count(), 4);
    }

    #[test]
    fn forward_outputs_probability_vector() {
        let mut g = small_graph(3);
        for i in 0..8 {
            let out = g.forward(&one_hot(8, i)).unwrap();
            assert_eq!(out.len(), 4);
            assert_finite(&out);
            assert!(out.iter().all(|&p| p >= 0.0));
            let sum: f32 = out.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "sum = {sum}");
        }
    }

    #[test]
    fn forward_rejects_oversized_input() {
        let mut g = small_graph(3);
        let err = g.forward(&[0.0; 9]).unwrap_err();
        assert!(matches!(
            err,
            Error::InputSize {
                expected: 8,
                actual: 9
            }
        ));
        assert!(g.selective_forward(&[0.0; 9], &[]).is_err());
    }

    #[test]
    fn short_input_leaves_remaining_inputs_untouched() {
        let mut g = small_graph(3);
        g.forward(&[0.5; 8]).unwrap();
        g.forward(&[1.0, 2.0]).unwrap();
        let acts: Vec<f32> = g.input_nodes().iter().map(|n| n.activation).collect();
        assert_eq!(&acts[..2], &[1.0, 2.0]);
        assert!(acts[2..].iter().all(|&a| a == 0.5));
    }

    #[test]
    fn each_dense_pass_appends_snapshot() {
        let cfg = GraphConfig {
            snapshot_capacity: 3,
            ..GraphConfig::with_size(4, 4, 2).with_seed(1)
        };
        let mut g = ComputationGraph::new(cfg).unwrap();
        for _ in 0..5 {
            g.forward(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        }
        let passes: Vec<u64> = g.snapshots().map(|s| s.pass).collect();
        assert_eq!(passes, vec![3, 4, 5]);
        let last = g.snapshots().last().unwrap();
        assert_eq!(last.output, g.last_output());
        assert_eq!(last.nodes.len(), 10);
    }

    #[test]
    fn empty_selection_matches_dense_exactly() {
        let mut dense = small_graph(11);
        let mut selective = small_graph(11);
        let x = one_hot(8, 2);
        let a = dense.forward(&x).unwrap();
        let b = selective.selective_forward(&x, &[]).unwrap();
        assert_eq!(a, b);

        // Ids outside the hidden layer do not count as a selection.
        let c = dense.forward(&x).unwrap();
        let d = selective
            .selective_forward(&x, &[NodeId(0), NodeId(27)])
            .unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn full_selection_matches_dense() {
        let mut dense = small_graph(5);
        let mut selective = small_graph(5);
        let all: Vec<NodeId> = selective.layout().hidden_ids().collect();
        for i in 0..4 {
            let x = one_hot(8, i);
            let a = dense.forward(&x).unwrap();
            let b = selective.selective_forward(&x, &all).unwrap();
            for (p, q) in a.iter().zip(&b) {
                assert!((p - q).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn inactive_hidden_nodes_keep_stale_activation() {
        let mut g = small_graph(9);
        g.forward(&one_hot(8, 0)).unwrap();
        let layout = g.layout();
        let stale: Vec<f32> = g.hidden_nodes().iter().map(|n| n.activation).collect();

        let active = [layout.hidden_id(0), layout.hidden_id(1)];
        let out = g.selective_forward(&one_hot(8, 5), &active).unwrap();
        assert_finite(&out);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-4);

        for (j, n) in g.hidden_nodes().iter().enumerate().skip(2) {
            assert_eq!(n.activation, stale[j], "hidden {j} must not be recomputed");
        }
        // Selective passes do not add snapshots.
        assert_eq!(g.snapshots().count(), 1);
    }

    #[test]
    fn train_step_reduces_loss_on_repeated_example() {
        let mut g = small_graph(21);
        let x = one_hot(8, 3);
        let first = g.train_step(&x, 2, 0.1).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = g.train_step(&x, 2, 0.1).unwrap();
        }
        assert!(last < first, "loss {first} -> {last}");
        assert_eq!(argmax(&g.forward(&x).unwrap()), Some(2));
    }

    #[test]
    fn train_step_rejects_bad_target() {
        let mut g = small_graph(21);
        assert!(matches!(
            g.train_step(&one_hot(8, 0), 4, 0.1),
            Err(Error::TargetOutOfRange {
                target: 4,
                outputs: 4
            })
        ));
    }

    #[test]
    fn weights_stay_clamped_under_large_learning_rate() {
        let mut g = small_graph(2);
        for step in 0..50 {
            let x = one_hot(8, step % 8);
            g.train_step(&x, step % 4, 50.0).unwrap();
        }
        for n in g.hidden_nodes().iter().chain(g.output_nodes()) {
            for d in &n.dendrites {
                assert!(d.weight.abs() <= WEIGHT_LIMIT);
            }
        }
        for n in g.input_nodes().iter().chain(g.hidden_nodes()) {
            for t in &n.axon_terminals {
                assert!((CONDUCTION_MIN..=CONDUCTION_MAX).contains(&t.conduction));
            }
        }
        for n in g.hidden_nodes() {
            for e in &n.skip_edges {
                assert!((SKIP_MIN..=SKIP_MAX).contains(&e.strength));
            }
        }
        assert_finite(&g.forward(&one_hot(8, 1)).unwrap());
    }

    #[test]
    fn conduction_tracks_dendrite_weight() {
        let mut g = small_graph(4);
        g.train_step(&one_hot(8, 1), 0, 0.5).unwrap();
        let layout = g.layout();
        let input = g.node(layout.input_id(1)).unwrap();
        let t = input.axon_terminals[3];
        let target = g.node(t.target).unwrap();
        let d = target
            .dendrites
            .iter()
            .find(|d| d.source == input.id)
            .unwrap();
        assert_eq!(t.conduction, d.weight.abs().clamp(CONDUCTION_MIN, CONDUCTION_MAX));
    }

    #[test]
    fn memory_average_prefers_recent() {
        let mut n = Node::new(NodeId(0), 3);
        assert_eq!(n.memory_average(), 0.0);
        n.trace.push(0.0);
        n.trace.push(1.0);
        let avg = n.memory_average();
        assert!(avg > 0.5 && avg < 1.0);
    }

    #[test]
    fn softmax_handles_large_values() {
        let p = softmax(&[1000.0, 1000.0, 0.0]);
        assert_finite(&p);
        assert!((p[0] - 0.5).abs() < 1e-4);
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn graph_image_roundtrip_reproduces_output() {
        let mut g = small_graph(17);
        for i in 0..6 {
            g.train_step(&one_hot(8, i), i % 4, 0.1).unwrap();
        }

        let mut bytes: Vec<u8> = Vec::new();
        g.save_image_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), g.image_size_bytes().unwrap());

        let mut cursor = std::io::Cursor::new(bytes);
        let mut loaded = ComputationGraph::load_image_from(&mut cursor).unwrap();

        assert_eq!(loaded.layout(), g.layout());
        assert_eq!(loaded.dense_passes(), g.dense_passes());
        assert_eq!(loaded.snapshots().count(), g.snapshots().count());

        let x = one_hot(8, 2);
        let a = g.forward(&x).unwrap();
        let b = loaded.forward(&x).unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-6, "{p} vs {q}");
        }
    }
}
