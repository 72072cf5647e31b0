//! Selective inference engine.
//!
//! Ranks the pathways held by a [`PathwayMemory`], turns the best of them
//! into an active node set, and runs the graph's selective pass over it.
//! Training and recording passes stay dense and feed the memory as they go.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};
#[cfg(feature = "serde")]
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::{ComputationGraph, GraphConfig, NodeId};
use crate::pathway::{MemoryConfig, PathwayMemory};
use crate::prng::Prng;
#[cfg(feature = "serde")]
use crate::storage::{self, EngineImage, GraphImage, MemoryImage};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceleratorConfig {
    /// Pathways kept by the top-K selection.
    pub top_k: usize,
    /// Both endpoint activations must exceed this for a pathway to be recorded.
    pub record_threshold: f32,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            top_k: 50,
            record_threshold: 0.01,
        }
    }
}

impl AcceleratorConfig {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if self.top_k == 0 {
            return Err("top_k must be >= 1");
        }
        if !self.record_threshold.is_finite() || self.record_threshold < 0.0 {
            return Err("record_threshold must be finite and >= 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceleratorStats {
    pub inferences: u64,
    pub average_active_nodes: f32,
    /// Average active hidden nodes over the hidden layer size.
    pub sparsity: f32,
    pub pathway_count: usize,
    pub top_k: usize,
    pub exploration_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkReport {
    pub iterations: usize,
    pub dense: Duration,
    pub selective: Duration,
    /// Dense time over selective time.
    pub speedup: f64,
    /// Average hidden nodes activated by the selective passes over the hidden layer size.
    pub sparsity: f32,
}

/// A pathway scored for selection.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    source: NodeId,
    target: NodeId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Total ordering on floats; ties broken by ids for stability.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.source.cmp(&self.source))
            .then_with(|| other.target.cmp(&self.target))
    }
}

pub struct Accelerator {
    cfg: AcceleratorConfig,
    graph: ComputationGraph,
    memory: PathwayMemory,

    inferences: u64,
    nodes_activated: u64,
}

impl Accelerator {
    pub fn new(graph: ComputationGraph, mut memory: PathwayMemory, cfg: AcceleratorConfig) -> Result<Self> {
        cfg.validate().map_err(Error::Configuration)?;
        let total = graph.layout().total();
        memory.set_node_space(u32::try_from(total).unwrap_or(u32::MAX));
        Ok(Self {
            cfg,
            graph,
            memory,
            inferences: 0,
            nodes_activated: 0,
        })
    }

    /// Build graph and memory from their configs. The memory PRNG is derived
    /// from the graph seed so one seed reproduces the whole engine.
    pub fn from_configs(graph: GraphConfig, memory: MemoryConfig, cfg: AcceleratorConfig) -> Result<Self> {
        let seed = graph.seed.unwrap_or(1);
        let graph = ComputationGraph::new(graph)?;
        let memory = PathwayMemory::new(memory, Prng::new(seed ^ 0x9E37_79B9_7F4A_7C15))?;
        Self::new(graph, memory, cfg)
    }

    #[must_use]
    pub fn config(&self) -> &AcceleratorConfig {
        &self.cfg
    }

    pub fn graph(&self) -> &ComputationGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ComputationGraph {
        &mut self.graph
    }

    pub fn memory(&self) -> &PathwayMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PathwayMemory {
        &mut self.memory
    }

    #[must_use]
    pub fn inferences(&self) -> u64 {
        self.inferences
    }

    /// Top-K pathways by score, best first.
    ///
    /// `score = strength² × ln(count + 1) × (1 + 1 / (1 + age))` where `age`
    /// is the inference count minus the pathway's last access, floored at zero.
    /// Last access is an access sequence number, so while recorded accesses
    /// outnumber inferences the age stays at zero and the bonus saturates at 1.
    pub fn ranked_pathways(&self) -> Vec<(NodeId, NodeId, f32)> {
        let top_k = self.cfg.top_k;
        if top_k == 0 {
            return Vec::new();
        }

        // Keep only the best K using a bounded min-heap.
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(top_k + 1);
        let now = self.inferences;
        for s in self.memory.strengths() {
            let age = now.saturating_sub(s.last_access) as f32;
            let recency_bonus = 1.0 / (1.0 + age);
            let score = s.strength * s.strength
                * ((s.access_count as f32) + 1.0).ln()
                * (1.0 + recency_bonus);
            let cand = Candidate {
                score,
                source: s.source,
                target: s.target,
            };

            if heap.len() < top_k {
                heap.push(Reverse(cand));
            } else if let Some(smallest) = heap.peek() {
                if cand > smallest.0 {
                    heap.pop();
                    heap.push(Reverse(cand));
                }
            }
        }

        let mut out: Vec<Candidate> = heap.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out.into_iter().map(|c| (c.source, c.target, c.score)).collect()
    }

    /// Union of the endpoints of the ranked pathways, ascending.
    pub fn active_set(&self) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self
            .ranked_pathways()
            .into_iter()
            .flat_map(|(s, t, _)| [s, t])
            .collect();
        set.into_iter().collect()
    }

    /// Selective pass over the nodes picked by the pathway ranking.
    ///
    /// With no cached pathway (or none touching the hidden layer) the graph
    /// runs its dense pass, and every hidden node counts as activated.
    pub fn fast_inference(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let active = self.active_set();
        let layout = self.graph.layout();
        let hidden_active = active
            .iter()
            .filter(|&&id| layout.hidden_offset(id).is_some())
            .count();

        let out = self.graph.selective_forward(input, &active)?;

        let activated = if hidden_active == 0 {
            layout.hidden
        } else {
            hidden_active
        };
        self.inferences = self.inferences.wrapping_add(1);
        self.nodes_activated = self.nodes_activated.saturating_add(activated as u64);
        Ok(out)
    }

    /// Dense pass that records every sufficiently active input→hidden and
    /// hidden→output pathway. The recorded signal is the source activation
    /// scaled by the edge's conduction.
    pub fn forward_and_record(&mut self, input: &[f32], context: &str) -> Result<Vec<f32>> {
        let out = self.graph.forward(input)?;
        self.record_pathways(context);
        Ok(out)
    }

    /// [`Self::forward_and_record`] followed by a gradient step. Returns the loss.
    pub fn train_step(&mut self, input: &[f32], target: usize, learning_rate: f32, context: &str) -> Result<f32> {
        let outputs = self.graph.layout().output;
        if target >= outputs {
            return Err(Error::TargetOutOfRange { target, outputs });
        }
        self.forward_and_record(input, context)?;
        self.graph.backward(target, learning_rate)
    }

    fn record_pathways(&mut self, context: &str) {
        let threshold = self.cfg.record_threshold;
        let graph = &self.graph;
        let memory = &mut self.memory;

        for src in graph.input_nodes().iter().chain(graph.hidden_nodes()) {
            if src.activation <= threshold {
                continue;
            }
            for t in &src.axon_terminals {
                let Some(target) = graph.activation(t.target) else {
                    continue;
                };
                if target > threshold {
                    memory.record_access(src.id, t.target, src.activation * t.conduction, context);
                }
            }
        }
    }

    /// `iterations` dense passes, then `iterations` fast inferences.
    pub fn run_benchmark(&mut self, input: &[f32], iterations: usize) -> Result<BenchmarkReport> {
        if iterations == 0 {
            return Err(Error::Configuration("benchmark needs at least one iteration"));
        }

        let start = Instant::now();
        for _ in 0..iterations {
            self.graph.forward(input)?;
        }
        let dense = start.elapsed();

        let activated_before = self.nodes_activated;
        let start = Instant::now();
        for _ in 0..iterations {
            self.fast_inference(input)?;
        }
        let selective = start.elapsed();

        let activated = self.nodes_activated - activated_before;
        let hidden = self.graph.layout().hidden as f32;
        let sparsity = (activated as f32 / iterations as f32) / hidden;
        let speedup = dense.as_secs_f64() / selective.as_secs_f64().max(f64::EPSILON);

        debug!(iterations, ?dense, ?selective, speedup, sparsity, "benchmark");
        Ok(BenchmarkReport {
            iterations,
            dense,
            selective,
            speedup,
            sparsity,
        })
    }

    /// Change K and the memory's exploration rate. Safe between inferences.
    pub fn configure(&mut self, top_k: usize, exploration_rate: f32) -> Result<()> {
        let cfg = AcceleratorConfig { top_k, ..self.cfg };
        cfg.validate().map_err(Error::Configuration)?;
        self.cfg = cfg;
        self.memory.set_exploration_rate(exploration_rate);
        info!(
            top_k,
            exploration_rate = self.memory.exploration_rate(),
            "accelerator configured"
        );
        Ok(())
    }

    pub fn stats(&self) -> AcceleratorStats {
        let average_active_nodes = if self.inferences == 0 {
            0.0
        } else {
            self.nodes_activated as f32 / self.inferences as f32
        };
        AcceleratorStats {
            inferences: self.inferences,
            average_active_nodes,
            sparsity: average_active_nodes / self.graph.layout().hidden as f32,
            pathway_count: self.memory.pathway_count(),
            top_k: self.cfg.top_k,
            exploration_rate: self.memory.exploration_rate(),
        }
    }
}

#[cfg(feature = "serde")]
impl Accelerator {
    /// One image holding the graph, the memory, and the engine counters.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        storage::write_header(w)?;
        storage::write_json_chunk(w, storage::GRAPH_TAG, &self.graph.to_image())?;
        storage::write_json_chunk(w, storage::MEMORY_TAG, &self.memory.to_image())?;
        storage::write_json_chunk(
            w,
            storage::ENGINE_TAG,
            &EngineImage {
                schema: storage::SCHEMA_VERSION,
                config: self.cfg,
                inferences: self.inferences,
                nodes_activated: self.nodes_activated,
            },
        )?;
        Ok(())
    }

    /// Graph and memory chunks are required; without an engine chunk the
    /// default config and zeroed counters are used.
    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        storage::read_header(r)?;
        let mut graph: Option<GraphImage> = None;
        let mut memory: Option<MemoryImage> = None;
        let mut engine: Option<EngineImage> = None;
        storage::for_each_chunk(r, |tag, payload| {
            match tag {
                storage::GRAPH_TAG => graph = Some(storage::decode_json(payload)?),
                storage::MEMORY_TAG => memory = Some(storage::decode_json(payload)?),
                storage::ENGINE_TAG => engine = Some(storage::decode_json(payload)?),
                _ => {}
            }
            Ok(())
        })?;

        let graph = graph.ok_or_else(|| Error::persistence("missing GRPH chunk"))?;
        let memory = memory.ok_or_else(|| Error::persistence("missing PMEM chunk"))?;
        let graph = ComputationGraph::from_image(graph)?;
        let memory = PathwayMemory::from_image(memory)?;

        let acc = match engine {
            Some(e) => {
                if e.schema != storage::SCHEMA_VERSION {
                    return Err(Error::persistence("unsupported engine schema version"));
                }
                let mut acc = Self::new(graph, memory, e.config)?;
                acc.inferences = e.inferences;
                acc.nodes_activated = e.nodes_activated;
                acc
            }
            None => Self::new(graph, memory, AcceleratorConfig::default())?,
        };
        info!(
            pathways = acc.memory.pathway_count(),
            episodes = acc.memory.episodes().len(),
            "accelerator image loaded"
        );
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::argmax;

    fn one_hot(n: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; n];
        v[i] = 1.0;
        v
    }

    fn engine(seed: u64, top_k: usize) -> Accelerator {
        Accelerator::from_configs(
            GraphConfig::default().with_seed(seed),
            MemoryConfig::default().with_exploration(0.0, 0.05),
            AcceleratorConfig::default().with_top_k(top_k),
        )
        .unwrap()
    }

    // Five (prompt, reply) pairs over a 32-input / 10-output graph.
    const PAIRS: [(usize, usize); 5] = [(0, 1), (3, 4), (7, 0), (12, 6), (20, 9)];

    fn train_pairs(acc: &mut Accelerator) {
        let mut lr = 0.1;
        for _epoch in 0..20 {
            for &(x, y) in &PAIRS {
                let loss = acc.train_step(&one_hot(32, x), y, lr, "train").unwrap();
                assert!(loss.is_finite());
            }
            lr *= 0.9;
        }
    }

    #[test]
    fn rejects_zero_top_k() {
        let res = Accelerator::from_configs(
            GraphConfig::default(),
            MemoryConfig::default(),
            AcceleratorConfig::default().with_top_k(0),
        );
        assert!(matches!(res, Err(Error::Configuration(_))));
    }

    #[test]
    fn trained_pairs_predict_their_replies() {
        let mut acc = engine(7, 50);
        train_pairs(&mut acc);
        for &(x, y) in &PAIRS {
            let out = acc.graph_mut().forward(&one_hot(32, x)).unwrap();
            assert_eq!(argmax(&out), Some(y), "prompt {x}");
        }
    }

    #[test]
    fn small_top_k_activates_a_subset() {
        let mut acc = engine(7, 20);
        train_pairs(&mut acc);
        assert!(acc.memory().pathway_count() > 20);

        let out = acc.fast_inference(&one_hot(32, 3)).unwrap();
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(out.iter().all(|p| p.is_finite() && *p >= 0.0));

        let stats = acc.stats();
        assert_eq!(stats.inferences, 1);
        assert!(stats.average_active_nodes < 64.0, "{stats:?}");
        assert!(stats.sparsity < 1.0);
    }

    #[test]
    fn ranking_is_bounded_and_sorted() {
        let mut acc = engine(3, 10);
        for i in 0..4 {
            acc.forward_and_record(&one_hot(32, i), "warmup").unwrap();
        }
        let ranked = acc.ranked_pathways();
        assert_eq!(ranked.len(), 10);
        for w in ranked.windows(2) {
            assert!(w[0].2 >= w[1].2);
        }
        assert!(acc.active_set().len() <= 20);
    }

    #[test]
    fn empty_cache_falls_back_to_dense() {
        let mut acc = engine(5, 20);
        let mut reference = ComputationGraph::new(GraphConfig::default().with_seed(5)).unwrap();
        let x = one_hot(32, 4);
        assert_eq!(acc.fast_inference(&x).unwrap(), reference.forward(&x).unwrap());
        assert_eq!(acc.stats().average_active_nodes, 64.0);
        assert_eq!(acc.graph().dense_passes(), 1);
    }

    #[test]
    fn recording_respects_threshold() {
        let mut acc = engine(9, 20);
        acc.forward_and_record(&one_hot(32, 2), "ctx").unwrap();
        let layout = acc.graph().layout();
        for r in acc.memory().history() {
            assert_eq!(r.context, "ctx");
            let src = acc.graph().activation(r.source).unwrap();
            let dst = acc.graph().activation(r.target).unwrap();
            assert!(src > 0.01 && dst > 0.01);
            let ok = (r.source == layout.input_id(2) && layout.hidden_offset(r.target).is_some())
                || (layout.hidden_offset(r.source).is_some()
                    && layout.output_offset(r.target).is_some());
            assert!(ok, "unexpected pathway {} -> {}", r.source, r.target);
        }
        assert!(acc.memory().sequence() > 0);
    }

    #[test]
    fn configure_updates_k_and_exploration() {
        let mut acc = engine(1, 20);
        acc.configure(5, 0.25).unwrap();
        assert_eq!(acc.config().top_k, 5);
        assert_eq!(acc.memory().exploration_rate(), 0.25);
        assert!(acc.configure(0, 0.1).is_err());
        assert_eq!(acc.config().top_k, 5);
    }

    #[test]
    fn benchmark_reports_both_modes() {
        let mut acc = engine(2, 20);
        acc.train_step(&one_hot(32, 1), 3, 0.1, "train").unwrap();
        let report = acc.run_benchmark(&one_hot(32, 1), 5).unwrap();
        assert_eq!(report.iterations, 5);
        assert!(report.sparsity > 0.0 && report.sparsity <= 1.0);
        assert!(report.speedup > 0.0);
        assert_eq!(acc.stats().inferences, 5);
        assert!(acc.run_benchmark(&one_hot(32, 1), 0).is_err());
    }

    #[test]
    fn train_step_rejects_bad_target_before_recording() {
        let mut acc = engine(2, 20);
        assert!(matches!(
            acc.train_step(&one_hot(32, 0), 10, 0.1, "x"),
            Err(Error::TargetOutOfRange { .. })
        ));
        assert_eq!(acc.memory().sequence(), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn image_roundtrip_keeps_selection() {
        let mut acc = engine(4, 20);
        for &(x, y) in &PAIRS {
            acc.train_step(&one_hot(32, x), y, 0.1, "train").unwrap();
        }
        acc.fast_inference(&one_hot(32, 0)).unwrap();

        let mut bytes = Vec::new();
        acc.save_image_to(&mut bytes).unwrap();
        let loaded = Accelerator::load_image_from(&mut std::io::Cursor::new(bytes)).unwrap();

        assert_eq!(loaded.config(), acc.config());
        assert_eq!(loaded.stats(), acc.stats());
        assert_eq!(loaded.active_set(), acc.active_set());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn truncated_engine_chunk_is_an_error() {
        let mut acc = engine(4, 7);
        acc.train_step(&one_hot(32, 1), 2, 0.1, "train").unwrap();
        acc.fast_inference(&one_hot(32, 1)).unwrap();

        let mut bytes = Vec::new();
        acc.save_image_to(&mut bytes).unwrap();
        let at = bytes
            .windows(4)
            .rposition(|w| w == storage::ENGINE_TAG)
            .unwrap();
        bytes.truncate(at + 6);

        let res = Accelerator::load_image_from(&mut std::io::Cursor::new(bytes));
        assert!(matches!(res, Err(Error::Persistence(_))));
    }
}
