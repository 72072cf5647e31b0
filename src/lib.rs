//! # synapse_cache
//!
//! A small layered computation graph with a reinforcement-scored pathway
//! cache. Training passes run dense and record which node-to-node pathways
//! carried signal; inference can then evaluate only the nodes those cached
//! pathways touch.
//!
//! ## Quick Start
//!
//! ```
//! use synapse_cache::prelude::*;
//!
//! let mut acc = Accelerator::from_configs(
//!     GraphConfig::with_size(8, 16, 4).with_seed(42),
//!     MemoryConfig::default(),
//!     AcceleratorConfig::default().with_top_k(20),
//! )
//! .unwrap();
//!
//! let mut x = vec![0.0; 8];
//! x[2] = 1.0;
//! acc.train_step(&x, 1, 0.1, "demo").unwrap();
//!
//! let probs = acc.fast_inference(&x).unwrap();
//! assert_eq!(probs.len(), 4);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): persistence images and serializable state
//! - `parallel`: parallel evaluation inside a dense pass via rayon
//!
//! ## Modules
//!
//! - [`graph`]: computation graph, dense and selective passes, backprop
//! - [`pathway`]: pathway memory with reinforcement, forgetting and episodes
//! - [`accelerator`]: top-K pathway selection and benchmarking
//! - [`ensemble`]: consensus over several graphs
//! - [`observer`]: read-only observation adapters

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/ring.rs"]
pub mod ring;

#[path = "core/graph.rs"]
pub mod graph;

#[path = "core/pathway.rs"]
pub mod pathway;

#[path = "core/accelerator.rs"]
pub mod accelerator;

#[path = "core/ensemble.rs"]
pub mod ensemble;

#[path = "core/vocab.rs"]
pub mod vocab;

#[path = "core/shared.rs"]
pub mod shared;

#[cfg(feature = "serde")]
#[path = "core/storage.rs"]
pub mod storage;

pub mod observer;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
///
/// ```
/// use synapse_cache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::accelerator::{Accelerator, AcceleratorConfig, AcceleratorStats, BenchmarkReport};
    pub use crate::ensemble::{consensus, ConsensusMode, Ensemble};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{
        argmax, softmax, Activation, ComputationGraph, GraphConfig, GraphDiagnostics, Layer, Layout,
        NetworkSnapshot, NodeId, Weight,
    };
    pub use crate::pathway::{
        EpisodicSnapshot, MemoryConfig, MemorySummary, PathwayMemory, PathwayRecord, PathwayStrength,
        SweepReport,
    };
    pub use crate::prng::Prng;
    pub use crate::shared::SharedAccelerator;
    pub use crate::vocab::Vocabulary;
}
