use std::sync::Arc;

use parking_lot::RwLock;

use crate::accelerator::{Accelerator, AcceleratorStats};
use crate::error::Result;
use crate::graph::NodeId;
use crate::pathway::{MemorySummary, PathwayStrength};

/// Cloneable handle enforcing single-writer access to one [`Accelerator`].
///
/// Anything that records, sweeps, scores or trains takes the write lock, so
/// ranking and eviction never observe a half-updated strength table. Summaries
/// and stats share the read lock.
#[derive(Clone)]
pub struct SharedAccelerator {
    inner: Arc<RwLock<Accelerator>>,
}

impl SharedAccelerator {
    pub fn new(acc: Accelerator) -> Self {
        Self {
            inner: Arc::new(RwLock::new(acc)),
        }
    }

    pub fn fast_inference(&self, input: &[f32]) -> Result<Vec<f32>> {
        self.inner.write().fast_inference(input)
    }

    pub fn forward_and_record(&self, input: &[f32], context: &str) -> Result<Vec<f32>> {
        self.inner.write().forward_and_record(input, context)
    }

    pub fn train_step(&self, input: &[f32], target: usize, learning_rate: f32, context: &str) -> Result<f32> {
        self.inner.write().train_step(input, target, learning_rate, context)
    }

    pub fn record_access(&self, source: NodeId, target: NodeId, strength: f32, context: &str) {
        self.inner
            .write()
            .memory_mut()
            .record_access(source, target, strength, context);
    }

    pub fn configure(&self, top_k: usize, exploration_rate: f32) -> Result<()> {
        self.inner.write().configure(top_k, exploration_rate)
    }

    pub fn consolidate(&self) -> MemorySummary {
        self.inner.read().memory().consolidate()
    }

    pub fn frequent_pathways(&self, min_access_count: u32) -> Vec<PathwayStrength> {
        self.inner.read().memory().frequent_pathways(min_access_count)
    }

    pub fn stats(&self) -> AcceleratorStats {
        self.inner.read().stats()
    }

    /// Run `f` under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Accelerator) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut Accelerator) -> R) -> R {
        f(&mut self.inner.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::AcceleratorConfig;
    use crate::graph::GraphConfig;
    use crate::pathway::MemoryConfig;
    use std::thread;

    #[test]
    fn concurrent_training_and_reads() {
        let acc = Accelerator::from_configs(
            GraphConfig::with_size(8, 16, 4).with_seed(3),
            MemoryConfig::default().with_exploration(0.0, 0.0),
            AcceleratorConfig::default().with_top_k(8),
        )
        .unwrap();
        let shared = SharedAccelerator::new(acc);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let mut x = vec![0.0; 8];
                    x[t] = 1.0;
                    for _ in 0..5 {
                        shared.train_step(&x, t, 0.1, "worker").unwrap();
                        let out = shared.fast_inference(&x).unwrap();
                        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-4);
                        let _ = shared.consolidate();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(shared.stats().inferences, 20);
        assert_eq!(shared.read(|a| a.graph().dense_passes()), 20);
    }

    #[test]
    fn record_access_goes_through_the_write_lock() {
        let acc = Accelerator::from_configs(
            GraphConfig::with_size(4, 4, 2).with_seed(1),
            MemoryConfig::default(),
            AcceleratorConfig::default(),
        )
        .unwrap();
        let shared = SharedAccelerator::new(acc);
        for _ in 0..3 {
            shared.record_access(NodeId(0), NodeId(4), 0.5, "manual");
        }
        let frequent = shared.frequent_pathways(3);
        assert_eq!(frequent.len(), 1);
        assert_eq!(shared.consolidate().strong_pathways, frequent);
    }
}
