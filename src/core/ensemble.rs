#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{argmax, ComputationGraph, GraphConfig};

/// How member outputs are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConsensusMode {
    /// Element-wise mean of the probability vectors.
    #[default]
    Average,
    /// Fraction of members whose argmax lands on each class.
    Vote,
    /// Element-wise maximum, renormalised to sum to 1.
    Max,
}

/// Combine member outputs. All outputs must have the same length.
pub fn consensus(outputs: &[Vec<f32>], mode: ConsensusMode) -> Result<Vec<f32>> {
    let first = outputs.first().ok_or(Error::EmptyEnsemble)?;
    let width = first.len();
    if outputs.iter().any(|o| o.len() != width) {
        return Err(Error::Configuration("ensemble outputs differ in length"));
    }
    let n = outputs.len() as f32;

    let combined = match mode {
        ConsensusMode::Average => {
            let mut acc = vec![0.0f32; width];
            for o in outputs {
                for (a, &p) in acc.iter_mut().zip(o) {
                    *a += p;
                }
            }
            acc.iter_mut().for_each(|a| *a /= n);
            acc
        }
        ConsensusMode::Vote => {
            let mut votes = vec![0.0f32; width];
            for o in outputs {
                if let Some(k) = argmax(o) {
                    votes[k] += 1.0;
                }
            }
            votes.iter_mut().for_each(|v| *v /= n);
            votes
        }
        ConsensusMode::Max => {
            let mut acc = first.clone();
            for o in &outputs[1..] {
                for (a, &p) in acc.iter_mut().zip(o) {
                    *a = a.max(p);
                }
            }
            let sum: f32 = acc.iter().sum();
            if sum > 0.0 {
                acc.iter_mut().for_each(|a| *a /= sum);
            }
            acc
        }
    };
    Ok(combined)
}

/// Several independently initialised graphs answering together.
pub struct Ensemble {
    members: Vec<ComputationGraph>,
    mode: ConsensusMode,
}

impl Ensemble {
    pub fn new(members: Vec<ComputationGraph>, mode: ConsensusMode) -> Result<Self> {
        let first = members.first().ok_or(Error::EmptyEnsemble)?;
        let layout = first.layout();
        if members.iter().any(|m| m.layout() != layout) {
            return Err(Error::Configuration("ensemble members differ in layout"));
        }
        Ok(Self { members, mode })
    }

    /// `count` graphs from one config; member `i` is seeded with `seed + i`.
    pub fn from_config(cfg: GraphConfig, count: usize, mode: ConsensusMode) -> Result<Self> {
        let base = cfg.seed.unwrap_or(1);
        let members = (0..count as u64)
            .map(|i| ComputationGraph::new(cfg.with_seed(base.wrapping_add(i))))
            .collect::<Result<Vec<_>>>()?;
        Self::new(members, mode)
    }

    pub fn members(&self) -> &[ComputationGraph] {
        &self.members
    }

    #[must_use]
    pub fn mode(&self) -> ConsensusMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ConsensusMode) {
        self.mode = mode;
    }

    pub fn forward(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        #[cfg(feature = "parallel")]
        let outputs = self
            .members
            .par_iter_mut()
            .map(|m| m.forward(input))
            .collect::<Result<Vec<_>>>()?;

        #[cfg(not(feature = "parallel"))]
        let outputs = self
            .members
            .iter_mut()
            .map(|m| m.forward(input))
            .collect::<Result<Vec<_>>>()?;

        consensus(&outputs, self.mode)
    }

    /// Train every member on the same example. Returns the mean loss.
    pub fn train_step(&mut self, input: &[f32], target: usize, learning_rate: f32) -> Result<f32> {
        let mut total = 0.0;
        for m in &mut self.members {
            total += m.train_step(input, target, learning_rate)?;
        }
        Ok(total / self.members.len() as f32)
    }
}
