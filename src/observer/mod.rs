use crate::accelerator::{Accelerator, AcceleratorStats};
use crate::graph::{GraphDiagnostics, NodeId};
use crate::pathway::{PathwayMemory, SweepReport};

/// A read-only snapshot of what the engine is doing.
///
/// Observers cannot mutate the engine; snapshotting allocates on demand and
/// leaves the inference path untouched.
#[derive(Debug, Clone)]
pub struct AcceleratorSnapshot {
    pub stats: AcceleratorStats,
    pub graph: GraphDiagnostics,
    pub memory: MemorySnapshot,
    /// Current top-K selection, best first.
    pub ranked: Vec<(NodeId, NodeId, f32)>,
    pub last_output: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub sequence: u64,
    pub pathway_count: usize,
    pub history_len: usize,
    pub recent_contexts: Vec<String>,
    pub episodes: Vec<(String, f32)>,
    pub last_sweep: Option<SweepReport>,
}

pub struct AcceleratorAdapter<'a> {
    acc: &'a Accelerator,
}

impl<'a> AcceleratorAdapter<'a> {
    pub fn new(acc: &'a Accelerator) -> Self {
        Self { acc }
    }

    pub fn snapshot(&self) -> AcceleratorSnapshot {
        AcceleratorSnapshot {
            stats: self.acc.stats(),
            graph: self.acc.graph().diagnostics(),
            memory: MemoryAdapter::new(self.acc.memory()).snapshot(),
            ranked: self.acc.ranked_pathways(),
            last_output: self.acc.graph().last_output().to_vec(),
        }
    }
}

pub struct MemoryAdapter<'a> {
    memory: &'a PathwayMemory,
}

impl<'a> MemoryAdapter<'a> {
    /// Contexts listed in a snapshot, newest first.
    pub const RECENT_CONTEXTS: usize = 8;

    pub fn new(memory: &'a PathwayMemory) -> Self {
        Self { memory }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let mut recent_contexts: Vec<String> = Vec::with_capacity(Self::RECENT_CONTEXTS);
        let history: Vec<_> = self.memory.history().collect();
        for r in history.iter().rev() {
            if recent_contexts.len() == Self::RECENT_CONTEXTS {
                break;
            }
            if !recent_contexts.contains(&r.context) {
                recent_contexts.push(r.context.clone());
            }
        }

        MemorySnapshot {
            sequence: self.memory.sequence(),
            pathway_count: self.memory.pathway_count(),
            history_len: history.len(),
            recent_contexts,
            episodes: self
                .memory
                .episodes()
                .iter()
                .map(|e| (e.name.clone(), e.importance))
                .collect(),
            last_sweep: self.memory.last_sweep(),
        }
    }
}
