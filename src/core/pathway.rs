use std::collections::BTreeMap;
#[cfg(feature = "serde")]
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::prng::Prng;
use crate::ring::RingBuffer;
#[cfg(feature = "serde")]
use crate::storage::{self, MemoryImage};

/// Context tag carried by synthetic records produced while exploring.
pub const EXPLORATION_CONTEXT: &str = "exploration";

/// One recorded access from `source` to `target`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PathwayRecord {
    pub source: NodeId,
    pub target: NodeId,
    pub signal: f32,
    pub sequence: u64,
    pub context: String,
}

/// Reinforcement state of one (source, target) pathway.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PathwayStrength {
    pub source: NodeId,
    pub target: NodeId,
    pub strength: f32,
    pub access_count: u32,
    /// Wall clock of the first access, ms since the UNIX epoch.
    pub first_access_ms: u64,
    /// Sequence number of the most recent access.
    pub last_access: u64,
}

/// A named activation pattern with an importance score.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EpisodicSnapshot {
    pub name: String,
    pub sequence: u64,
    pub activations: BTreeMap<NodeId, f32>,
    pub context: String,
    pub recorded_ms: u64,
    pub last_access: u64,
    pub importance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryConfig {
    /// Capacity of the access history FIFO.
    pub history_capacity: usize,

    /// Strength added on every repeat access (LTP analog).
    pub reinforcement: f32,

    // Forgetting: every `sweep_interval` accesses, pathways idle for more than
    // `decay_age_threshold` accesses lose `forgetting_rate` of their strength.
    pub forgetting_rate: f32,
    pub decay_age_threshold: u64,
    pub sweep_interval: u64,
    pub strength_floor: f32,

    /// Probability of returning synthetic/random results from a recall.
    pub exploration_rate: f32,
    /// Half-width of the uniform noise added to recalled signal strengths.
    pub noise_level: f32,

    pub initial_importance: f32,
    pub importance_increment: f32,
    pub importance_floor: f32,

    /// Exclusive upper bound for synthetic record targets.
    pub node_space: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            reinforcement: 0.1,
            forgetting_rate: 0.05,
            decay_age_threshold: 50,
            sweep_interval: 10,
            strength_floor: 0.1,
            exploration_rate: 0.1,
            noise_level: 0.05,
            initial_importance: 0.5,
            importance_increment: 0.1,
            importance_floor: 0.3,
            node_space: 128,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if self.history_capacity == 0 {
            return Err("history_capacity must be >= 1");
        }
        if !self.reinforcement.is_finite() || self.reinforcement < 0.0 {
            return Err("reinforcement must be finite and >= 0");
        }
        if !(0.0..=1.0).contains(&self.forgetting_rate) {
            return Err("forgetting_rate must be in [0, 1]");
        }
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be >= 1");
        }
        if !self.strength_floor.is_finite() || self.strength_floor < 0.0 {
            return Err("strength_floor must be finite and >= 0");
        }
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err("exploration_rate must be in [0, 1]");
        }
        if !self.noise_level.is_finite() || self.noise_level < 0.0 {
            return Err("noise_level must be finite and >= 0");
        }
        if !(0.0..=1.0).contains(&self.initial_importance) {
            return Err("initial_importance must be in [0, 1]");
        }
        if !self.importance_increment.is_finite() || self.importance_increment < 0.0 {
            return Err("importance_increment must be finite and >= 0");
        }
        if !(0.0..=1.0).contains(&self.importance_floor) {
            return Err("importance_floor must be in [0, 1]");
        }
        if self.node_space == 0 {
            return Err("node_space must be >= 1");
        }
        Ok(())
    }

    pub fn with_exploration(mut self, rate: f32, noise: f32) -> Self {
        self.exploration_rate = rate;
        self.noise_level = noise;
        self
    }

    pub fn with_forgetting(mut self, rate: f32, age_threshold: u64, floor: f32) -> Self {
        self.forgetting_rate = rate;
        self.decay_age_threshold = age_threshold;
        self.strength_floor = floor;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_node_space(mut self, node_space: u32) -> Self {
        self.node_space = node_space;
        self
    }
}

/// Outcome of one forgetting sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SweepReport {
    pub sequence: u64,
    pub decayed: usize,
    pub pruned_pathways: usize,
    pub pruned_episodes: usize,
}

/// Read-only digest produced by [`PathwayMemory::consolidate`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemorySummary {
    pub recorded_accesses: usize,
    pub episode_count: usize,
    pub strong_pathways: Vec<PathwayStrength>,
}

/// Access count a pathway needs before `consolidate` lists it.
pub const CONSOLIDATION_MIN_ACCESSES: u32 = 3;

pub struct PathwayMemory {
    cfg: MemoryConfig,
    rng: Prng,

    history: RingBuffer<PathwayRecord>,

    // Key is packed (source,target) into u64.
    strengths: HashMap<u64, PathwayStrength>,

    // Insertion order is kept so random picks are reproducible.
    episodes: Vec<EpisodicSnapshot>,

    // Monotonic; advanced by every recorded access.
    sequence: u64,

    last_sweep: Option<SweepReport>,
}

impl PathwayMemory {
    pub fn new(cfg: MemoryConfig, rng: Prng) -> Result<Self> {
        cfg.validate().map_err(Error::Configuration)?;
        Ok(Self {
            cfg,
            rng,
            history: RingBuffer::new(cfg.history_capacity),
            strengths: HashMap::new(),
            episodes: Vec::new(),
            sequence: 0,
            last_sweep: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn exploration_rate(&self) -> f32 {
        self.cfg.exploration_rate
    }

    pub fn set_exploration_rate(&mut self, rate: f32) {
        self.cfg.exploration_rate = if rate.is_finite() {
            rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    pub(crate) fn set_node_space(&mut self, node_space: u32) {
        self.cfg.node_space = node_space.max(1);
    }

    /// Access history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PathwayRecord> {
        self.history.iter()
    }

    /// Strength table in unspecified order.
    pub fn strengths(&self) -> impl Iterator<Item = &PathwayStrength> {
        self.strengths.values()
    }

    #[must_use]
    pub fn pathway_count(&self) -> usize {
        self.strengths.len()
    }

    pub fn strength(&self, source: NodeId, target: NodeId) -> Option<&PathwayStrength> {
        self.strengths.get(&pack(source, target))
    }

    pub fn episodes(&self) -> &[EpisodicSnapshot] {
        &self.episodes
    }

    #[must_use]
    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep
    }

    /// Record one access and reinforce its pathway.
    ///
    /// Every `sweep_interval`-th access runs [`Self::forget`]; the report is
    /// returned when that happens.
    pub fn record_access(
        &mut self,
        source: NodeId,
        target: NodeId,
        strength: f32,
        context: &str,
    ) -> Option<SweepReport> {
        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;
        let signal = if strength.is_finite() {
            strength.clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.history.push(PathwayRecord {
            source,
            target,
            signal,
            sequence: seq,
            context: context.to_string(),
        });

        let reinforcement = self.cfg.reinforcement;
        self.strengths
            .entry(pack(source, target))
            .and_modify(|s| {
                s.strength += reinforcement;
                s.access_count = s.access_count.saturating_add(1);
                s.last_access = seq;
            })
            .or_insert_with(|| PathwayStrength {
                source,
                target,
                strength: signal,
                access_count: 1,
                first_access_ms: now_ms(),
                last_access: seq,
            });

        if seq % self.cfg.sweep_interval == 0 {
            Some(self.forget())
        } else {
            None
        }
    }

    /// Decay idle pathways, drop those below the floor, and prune stale episodes.
    ///
    /// Episodes idle for more than twice the decay threshold go if their
    /// importance is below the floor, or otherwise with probability
    /// `forgetting_rate` drawn from the owned PRNG.
    pub fn forget(&mut self) -> SweepReport {
        let seq = self.sequence;
        let threshold = self.cfg.decay_age_threshold;
        let keep = 1.0 - self.cfg.forgetting_rate;
        let floor = self.cfg.strength_floor;

        let mut decayed = 0usize;
        let mut pruned_pathways = 0usize;
        self.strengths.retain(|_, s| {
            if seq.saturating_sub(s.last_access) > threshold {
                s.strength *= keep;
                decayed += 1;
                if s.strength < floor {
                    pruned_pathways += 1;
                    return false;
                }
            }
            true
        });

        let episode_threshold = threshold.saturating_mul(2);
        let importance_floor = self.cfg.importance_floor;
        let rate = self.cfg.forgetting_rate;
        let rng = &mut self.rng;
        let before = self.episodes.len();
        self.episodes.retain(|e| {
            if seq.saturating_sub(e.last_access) <= episode_threshold {
                return true;
            }
            let forgotten = e.importance < importance_floor || rng.gen_bool(rate);
            !forgotten
        });
        let pruned_episodes = before - self.episodes.len();

        let report = SweepReport {
            sequence: seq,
            decayed,
            pruned_pathways,
            pruned_episodes,
        };
        debug!(
            sequence = seq,
            decayed,
            pruned_pathways,
            pruned_episodes,
            remaining = self.strengths.len(),
            "forgetting sweep"
        );
        self.last_sweep = Some(report);
        report
    }

    /// Recent accesses leaving `node`.
    ///
    /// With probability `exploration_rate` this returns synthetic records
    /// (random targets and strengths) instead. Otherwise it returns the
    /// history records from the last `recent_steps` sequence ticks, each with
    /// uniform noise of ±`noise_level` on its signal.
    pub fn recall_access_pattern(&mut self, node: NodeId, recent_steps: u64) -> Vec<PathwayRecord> {
        if self.rng.gen_bool(self.cfg.exploration_rate) {
            let n = usize::try_from(recent_steps)
                .unwrap_or(usize::MAX)
                .min(self.history.capacity());
            let space = self.cfg.node_space as usize;
            let seq = self.sequence;
            return (0..n)
                .map(|_| PathwayRecord {
                    source: node,
                    target: NodeId(self.rng.gen_range_usize(0, space) as u32),
                    signal: self.rng.next_f32_01(),
                    sequence: seq,
                    context: EXPLORATION_CONTEXT.to_string(),
                })
                .collect();
        }

        let since = self.sequence.saturating_sub(recent_steps);
        let noise = self.cfg.noise_level;
        let recalled: Vec<PathwayRecord> = self
            .history
            .iter()
            .filter(|r| r.source == node && r.sequence > since)
            .cloned()
            .collect();

        recalled
            .into_iter()
            .map(|mut r| {
                r.signal = (r.signal + self.rng.gen_range_f32(-noise, noise)).clamp(0.0, 1.0);
                r
            })
            .collect()
    }

    /// Store an activation pattern under `name`, replacing any episode of the same name.
    pub fn save_episode(
        &mut self,
        name: &str,
        activations: BTreeMap<NodeId, f32>,
        context: &str,
    ) -> &EpisodicSnapshot {
        let episode = EpisodicSnapshot {
            name: name.to_string(),
            sequence: self.sequence,
            activations,
            context: context.to_string(),
            recorded_ms: now_ms(),
            last_access: self.sequence,
            importance: self.cfg.initial_importance,
        };

        let idx = match self.episodes.iter().position(|e| e.name == name) {
            Some(idx) => {
                self.episodes[idx] = episode;
                idx
            }
            None => {
                self.episodes.push(episode);
                self.episodes.len() - 1
            }
        };
        &self.episodes[idx]
    }

    /// Look up an episode by name.
    ///
    /// With probability `exploration_rate` a uniformly random episode is
    /// returned instead. The returned episode gains importance and its last
    /// access is refreshed.
    pub fn recall_episode(&mut self, name: &str) -> Option<EpisodicSnapshot> {
        if self.episodes.is_empty() {
            return None;
        }

        let idx = if self.rng.gen_bool(self.cfg.exploration_rate) {
            self.rng.gen_range_usize(0, self.episodes.len())
        } else {
            self.episodes.iter().position(|e| e.name == name)?
        };

        let seq = self.sequence;
        let inc = self.cfg.importance_increment;
        let e = &mut self.episodes[idx];
        e.importance = (e.importance + inc).min(1.0);
        e.last_access = seq;
        Some(e.clone())
    }

    /// Blend two distinct random episodes into a new one stored as `name`.
    ///
    /// Nodes present in both get the mean of the two activations; nodes
    /// present in one keep their value. Returns `None` with fewer than two
    /// stored episodes.
    pub fn create_novel_episode(&mut self, name: &str) -> Option<EpisodicSnapshot> {
        let n = self.episodes.len();
        if n < 2 {
            return None;
        }

        let a = self.rng.gen_range_usize(0, n);
        let mut b = self.rng.gen_range_usize(0, n - 1);
        if b >= a {
            b += 1;
        }

        let first = &self.episodes[a];
        let second = &self.episodes[b];
        let mut merged = first.activations.clone();
        for (&id, &v) in &second.activations {
            merged
                .entry(id)
                .and_modify(|x| *x = 0.5 * *x + 0.5 * v)
                .or_insert(v);
        }
        let context = format!("novel:{}+{}", first.name, second.name);

        Some(self.save_episode(name, merged, &context).clone())
    }

    /// Pathways accessed at least `min_access_count` times, strongest first.
    pub fn frequent_pathways(&self, min_access_count: u32) -> Vec<PathwayStrength> {
        let mut out: Vec<PathwayStrength> = self
            .strengths
            .values()
            .filter(|s| s.access_count >= min_access_count)
            .cloned()
            .collect();
        out.sort_by(|x, y| {
            y.strength
                .total_cmp(&x.strength)
                .then_with(|| x.source.cmp(&y.source))
                .then_with(|| x.target.cmp(&y.target))
        });
        out
    }

    /// Summary of what the memory currently holds. Does not mutate.
    pub fn consolidate(&self) -> MemorySummary {
        MemorySummary {
            recorded_accesses: self.history.len(),
            episode_count: self.episodes.len(),
            strong_pathways: self.frequent_pathways(CONSOLIDATION_MIN_ACCESSES),
        }
    }
}

#[cfg(feature = "serde")]
impl PathwayMemory {
    pub fn to_image(&self) -> MemoryImage {
        let mut strengths: Vec<PathwayStrength> = self.strengths.values().cloned().collect();
        strengths.sort_by_key(|s| pack(s.source, s.target));

        MemoryImage {
            schema: storage::SCHEMA_VERSION,
            config: self.cfg,
            sequence: self.sequence,
            rng_state: self.rng.state(),
            history: self.history.to_vec(),
            strengths,
            episodes: self.episodes.clone(),
        }
    }

    pub fn from_image(image: MemoryImage) -> Result<Self> {
        if image.schema != storage::SCHEMA_VERSION {
            return Err(Error::persistence("unsupported memory schema version"));
        }
        image.config.validate().map_err(Error::Configuration)?;

        let mut strengths = HashMap::with_capacity(image.strengths.len());
        for s in image.strengths {
            if s.last_access > image.sequence {
                return Err(Error::persistence("pathway accessed after current sequence"));
            }
            if strengths.insert(pack(s.source, s.target), s).is_some() {
                return Err(Error::persistence("duplicate pathway entry"));
            }
        }

        Ok(Self {
            cfg: image.config,
            rng: Prng::from_state(image.rng_state),
            history: RingBuffer::from_vec(image.config.history_capacity, image.history),
            strengths,
            episodes: image.episodes,
            sequence: image.sequence,
            last_sweep: None,
        })
    }

    /// Serialize a versioned memory image (header + one `PMEM` chunk).
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        storage::write_header(w)?;
        storage::write_json_chunk(w, storage::MEMORY_TAG, &self.to_image())
    }

    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        storage::read_header(r)?;
        let mut image: Option<MemoryImage> = None;
        storage::for_each_chunk(r, |tag, payload| {
            if tag == storage::MEMORY_TAG {
                image = Some(storage::decode_json(payload)?);
            }
            Ok(())
        })?;
        let image = image.ok_or_else(|| Error::persistence("missing PMEM chunk"))?;
        Self::from_image(image)
    }
}

fn pack(a: NodeId, b: NodeId) -> u64 {
    ((a.0 as u64) << 32) | (b.0 as u64)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
