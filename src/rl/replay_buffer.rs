//! Experience replay buffer for off-policy training.
//!
//! Fixed-capacity ring of [`Transition`]s addressed by a monotonically
//! increasing insertion counter (mod capacity). Supports:
//! - n-step return accumulation ahead of storage
//! - uniform sampling or proportional prioritized sampling with
//!   importance-sampling correction
//! - JSON snapshots so long runs can resume without re-warming

use std::collections::VecDeque;
use std::path::Path;

use ndarray::Array1;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::checkpoint::write_json_atomic;
use super::data::{Transition, TransitionBatch};
use super::sum_tree::SumTree;
use crate::error::{Result, TraderError};

/// Lower bound applied to every stored priority
const MIN_PRIORITY: f64 = 1e-6;

/// Prioritized replay parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerConfig {
    /// Priority exponent
    pub alpha: f64,
    /// Initial importance-sampling exponent
    pub beta: f64,
    /// Number of `sample` calls over which beta anneals to 1.0
    pub beta_steps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBufferConfig {
    pub capacity: usize,
    pub nstep: usize,
    pub discount: f64,
    pub prioritized: Option<PerConfig>,
}

impl ReplayBufferConfig {
    pub fn uniform(capacity: usize) -> Self {
        Self {
            capacity,
            nstep: 1,
            discount: 1.0,
            prioritized: None,
        }
    }
}

/// Layout every stored record must share: price shape, portfolio length,
/// action length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecordLayout {
    price: Vec<usize>,
    portfolio: usize,
    actions: usize,
}

impl RecordLayout {
    fn of(t: &Transition) -> Self {
        Self {
            price: t.state.price.shape().to_vec(),
            portfolio: t.state.portfolio.len(),
            actions: t.action.len(),
        }
    }

    fn matches(&self, t: &Transition) -> bool {
        t.state.price.shape() == self.price.as_slice()
            && t.next_state.price.shape() == self.price.as_slice()
            && t.state.portfolio.len() == self.portfolio
            && t.next_state.portfolio.len() == self.portfolio
            && t.action.len() == self.actions
    }
}

/// Ring buffer of transitions with optional priorities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayBuffer {
    config: ReplayBufferConfig,
    storage: Vec<Transition>,
    /// Total records ever inserted; slot = inserted % capacity
    inserted: u64,
    priorities: Option<SumTree>,
    max_priority: f64,
    samples_drawn: u64,
    layout: Option<RecordLayout>,
    nstep_pending: VecDeque<Transition>,
    #[serde(skip)]
    last_sampled: Vec<usize>,
}

impl ReplayBuffer {
    pub fn new(config: ReplayBufferConfig) -> Self {
        let priorities = config
            .prioritized
            .as_ref()
            .map(|_| SumTree::new(config.capacity));
        Self {
            storage: Vec::with_capacity(config.capacity.min(1 << 16)),
            inserted: 0,
            priorities,
            max_priority: 1.0,
            samples_drawn: 0,
            layout: None,
            nstep_pending: VecDeque::with_capacity(config.nstep),
            last_sampled: Vec::new(),
            config,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(ReplayBufferConfig::uniform(capacity))
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_prioritized(&self) -> bool {
        self.priorities.is_some()
    }

    pub fn config(&self) -> &ReplayBufferConfig {
        &self.config
    }

    /// Records waiting in the n-step accumulator
    pub fn pending_nstep(&self) -> usize {
        self.nstep_pending.len()
    }

    /// Add a transition. With `nstep > 1` it is accumulated first and the
    /// folded n-step record is stored once enough steps (or a terminal step)
    /// have arrived.
    pub fn add(&mut self, transition: Transition) -> Result<()> {
        match &self.layout {
            Some(layout) if !layout.matches(&transition) => {
                return Err(TraderError::shape(format!(
                    "transition layout {:?} differs from buffer layout {:?}",
                    RecordLayout::of(&transition),
                    layout
                )));
            }
            None => self.layout = Some(RecordLayout::of(&transition)),
            _ => {}
        }

        if self.config.nstep <= 1 {
            self.insert(transition);
            return Ok(());
        }

        let done = transition.done;
        self.nstep_pending.push_back(transition);
        if done {
            while !self.nstep_pending.is_empty() {
                let folded = self.fold_pending();
                self.insert(folded);
                self.nstep_pending.pop_front();
            }
        } else if self.nstep_pending.len() >= self.config.nstep {
            let folded = self.fold_pending();
            self.insert(folded);
            self.nstep_pending.pop_front();
        }
        Ok(())
    }

    /// Drop any partial n-step accumulation (episode boundary).
    pub fn clear_nstep(&mut self) {
        self.nstep_pending.clear();
    }

    pub fn clear(&mut self) {
        self.storage.clear();
        self.inserted = 0;
        self.nstep_pending.clear();
        self.last_sampled.clear();
        self.max_priority = 1.0;
        if self.priorities.is_some() {
            self.priorities = Some(SumTree::new(self.config.capacity));
        }
    }

    /// Front of the pending queue with its discounted return over the queue
    fn fold_pending(&self) -> Transition {
        let first = &self.nstep_pending[0];
        let last = &self.nstep_pending[self.nstep_pending.len() - 1];
        let mut reward = vec![0.0f32; first.reward.len()];
        let mut gamma = 1.0f64;
        for t in &self.nstep_pending {
            for (acc, r) in reward.iter_mut().zip(t.reward.iter()) {
                *acc += (gamma * *r as f64) as f32;
            }
            gamma *= self.config.discount;
        }
        Transition {
            state: first.state.clone(),
            action: first.action.clone(),
            reward,
            next_state: last.next_state.clone(),
            done: last.done,
        }
    }

    fn insert(&mut self, transition: Transition) {
        let slot = (self.inserted % self.config.capacity as u64) as usize;
        if self.storage.len() < self.config.capacity {
            self.storage.push(transition);
        } else {
            self.storage[slot] = transition;
        }
        self.inserted += 1;

        if let (Some(tree), Some(per)) = (self.priorities.as_mut(), self.config.prioritized.as_ref()) {
            tree.set(slot, self.max_priority.powf(per.alpha));
        }
    }

    /// Current importance-sampling exponent after annealing
    pub fn beta(&self) -> f64 {
        match &self.config.prioritized {
            Some(per) if per.beta_steps > 0 => {
                let frac = (self.samples_drawn as f64 / per.beta_steps as f64).min(1.0);
                per.beta + (1.0 - per.beta) * frac
            }
            Some(per) => per.beta,
            None => 0.0,
        }
    }

    /// Sample `batch_size` transitions.
    ///
    /// Uniform mode draws distinct slots; prioritized mode draws one slot per
    /// equal-mass segment of the priority distribution and attaches
    /// max-normalised importance weights.
    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<TransitionBatch> {
        if batch_size > self.len() {
            return Err(TraderError::InsufficientData {
                requested: batch_size,
                available: self.len(),
            });
        }
        if batch_size == 0 {
            return Err(TraderError::shape("batch_size must be positive"));
        }

        let (indices, weights) = match (&self.priorities, &self.config.prioritized) {
            (Some(tree), Some(_)) => {
                let beta = self.beta();
                let total = tree.total();
                let segment = total / batch_size as f64;
                let n = self.len() as f64;
                let mut indices = Vec::with_capacity(batch_size);
                let mut weights = Vec::with_capacity(batch_size);
                for i in 0..batch_size {
                    let lo = segment * i as f64;
                    let mass = lo + rng.gen::<f64>() * segment;
                    let idx = tree.find(mass).min(self.len() - 1);
                    let p = (tree.get(idx) / total).max(f64::MIN_POSITIVE);
                    indices.push(idx);
                    weights.push((n * p).powf(-beta));
                }
                let max_w = weights.iter().cloned().fold(f64::MIN_POSITIVE, f64::max);
                let weights: Array1<f32> = weights.iter().map(|w| (w / max_w) as f32).collect();
                (indices, Some(weights))
            }
            _ => (index::sample(rng, self.len(), batch_size).into_vec(), None),
        };

        let records: Vec<&Transition> = indices.iter().map(|&i| &self.storage[i]).collect();
        let mut batch = TransitionBatch::from_transitions(&records)?;
        batch.weights = weights;
        batch.indices = indices.clone();
        self.last_sampled = indices;
        self.samples_drawn += 1;
        Ok(batch)
    }

    /// Overwrite priorities for the given slots.
    pub fn update_priority(&mut self, indices: &[usize], priorities: &[f64]) -> Result<()> {
        if indices.len() != priorities.len() {
            return Err(TraderError::shape(format!(
                "{} indices but {} priorities",
                indices.len(),
                priorities.len()
            )));
        }
        let (tree, per) = match (self.priorities.as_mut(), self.config.prioritized.as_ref()) {
            (Some(tree), Some(per)) => (tree, per),
            _ => return Ok(()),
        };
        for (&idx, &p) in indices.iter().zip(priorities) {
            if idx >= self.storage.len() {
                return Err(TraderError::shape(format!(
                    "priority index {} out of range for buffer of length {}",
                    idx,
                    self.storage.len()
                )));
            }
            let p = if p.is_finite() { p.abs().max(MIN_PRIORITY) } else { self.max_priority };
            tree.set(idx, p.powf(per.alpha));
            self.max_priority = self.max_priority.max(p);
        }
        Ok(())
    }

    /// Overwrite priorities for the most recently sampled batch.
    pub fn update_last_priorities(&mut self, priorities: &[f64]) -> Result<()> {
        let indices = std::mem::take(&mut self.last_sampled);
        let res = self.update_priority(&indices, priorities);
        self.last_sampled = indices;
        res
    }

    /// Sampling mass of a slot (priority raised to alpha)
    pub fn priority_mass(&self, index: usize) -> Option<f64> {
        self.priorities.as_ref().map(|t| t.get(index))
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let split = if self.storage.len() < self.config.capacity {
            0
        } else {
            (self.inserted % self.config.capacity as u64) as usize
        };
        self.storage[split..].iter().chain(self.storage[..split].iter())
    }

    pub fn average_reward(&self) -> f64 {
        if self.storage.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.storage.iter().map(|t| t.total_reward() as f64).sum();
        sum / self.storage.len() as f64
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write a JSON snapshot via a temporary file and rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_json_atomic(path, self)?;
        info!(path = %path.display(), len = self.len(), "[RL] Replay buffer saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| TraderError::io(path, e))?;
        let buffer: Self = serde_json::from_slice(&bytes)?;
        debug!(path = %path.display(), len = buffer.len(), "[RL] Replay buffer loaded");
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::data::Observation;
    use ndarray::{Array1, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn make_transition(reward: f32, done: bool) -> Transition {
        let obs = Observation::new(Array3::zeros((2, 1, 1)), Array1::zeros(2), 0);
        Transition::new(obs.clone(), vec![1], vec![reward], obs, done)
    }

    fn rewards(buffer: &ReplayBuffer) -> Vec<f32> {
        buffer.iter().map(|t| t.reward[0]).collect()
    }

    #[test]
    fn test_ring_eviction_keeps_most_recent() {
        let mut buffer = ReplayBuffer::with_capacity(3);
        for i in 0..7 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(rewards(&buffer), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_sample_more_than_len_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut buffer = ReplayBuffer::with_capacity(10);
        for i in 0..3 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        match buffer.sample(4, &mut rng) {
            Err(TraderError::InsufficientData {
                requested,
                available,
            }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected InsufficientData, got {:?}", other.map(|b| b.len())),
        }
        assert_eq!(buffer.sample(3, &mut rng).unwrap().len(), 3);
    }

    #[test]
    fn test_sample_two_of_three() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut buffer = ReplayBuffer::with_capacity(4);
        for r in [0.1f32, 0.2, 0.3] {
            buffer.add(make_transition(r, false)).unwrap();
        }
        for _ in 0..20 {
            let batch = buffer.sample(2, &mut rng).unwrap();
            assert_eq!(batch.len(), 2);
            let a = batch.rewards[[0, 0]];
            let b = batch.rewards[[1, 0]];
            assert_ne!(a, b);
            for r in [a, b] {
                assert!([0.1f32, 0.2, 0.3].contains(&r));
            }
        }
    }

    #[test]
    fn test_nstep_folds_discounted_rewards() {
        let mut buffer = ReplayBuffer::new(ReplayBufferConfig {
            capacity: 10,
            nstep: 3,
            discount: 0.5,
            prioritized: None,
        });
        buffer.add(make_transition(1.0, false)).unwrap();
        buffer.add(make_transition(2.0, false)).unwrap();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.pending_nstep(), 2);
        buffer.add(make_transition(4.0, false)).unwrap();
        assert_eq!(buffer.len(), 1);
        // 1 + 0.5*2 + 0.25*4
        assert!((rewards(&buffer)[0] - 3.0).abs() < 1e-6);
        assert!(!buffer.iter().next().unwrap().done);
    }

    #[test]
    fn test_nstep_flushes_on_done() {
        let mut buffer = ReplayBuffer::new(ReplayBufferConfig {
            capacity: 10,
            nstep: 3,
            discount: 1.0,
            prioritized: None,
        });
        buffer.add(make_transition(1.0, false)).unwrap();
        buffer.add(make_transition(2.0, true)).unwrap();
        assert_eq!(buffer.pending_nstep(), 0);
        assert_eq!(rewards(&buffer), vec![3.0, 2.0]);
        assert!(buffer.iter().all(|t| t.done));
    }

    #[test]
    fn test_clear_nstep_drops_partial() {
        let mut buffer = ReplayBuffer::new(ReplayBufferConfig {
            capacity: 10,
            nstep: 3,
            discount: 1.0,
            prioritized: None,
        });
        buffer.add(make_transition(1.0, false)).unwrap();
        buffer.add(make_transition(2.0, false)).unwrap();
        buffer.clear_nstep();
        buffer.add(make_transition(5.0, false)).unwrap();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.pending_nstep(), 1);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mut buffer = ReplayBuffer::with_capacity(4);
        buffer.add(make_transition(0.0, false)).unwrap();
        let obs = Observation::new(Array3::zeros((3, 1, 1)), Array1::zeros(2), 0);
        let bad = Transition::new(obs.clone(), vec![1], vec![0.0], obs, false);
        assert!(matches!(buffer.add(bad), Err(TraderError::Shape(_))));
    }

    fn prioritized(capacity: usize) -> ReplayBuffer {
        ReplayBuffer::new(ReplayBufferConfig {
            capacity,
            nstep: 1,
            discount: 1.0,
            prioritized: Some(PerConfig {
                alpha: 1.0,
                beta: 0.4,
                beta_steps: 10,
            }),
        })
    }

    #[test]
    fn test_prioritized_sampling_prefers_high_priority() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut buffer = prioritized(4);
        for i in 0..4 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        buffer.update_priority(&[0, 1, 2, 3], &[1e-6, 1e-6, 1e-6, 10.0]).unwrap();
        let mut hits = 0;
        for _ in 0..50 {
            let batch = buffer.sample(1, &mut rng).unwrap();
            if batch.indices[0] == 3 {
                hits += 1;
            }
            let w = batch.weights.unwrap();
            assert!((w[0] - 1.0).abs() < 1e-6);
        }
        assert!(hits >= 49);
    }

    #[test]
    fn test_importance_weights_normalised() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut buffer = prioritized(8);
        for i in 0..8 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        buffer
            .update_priority(&[0, 1, 2, 3, 4, 5, 6, 7], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let batch = buffer.sample(4, &mut rng).unwrap();
        let w = batch.weights.unwrap();
        let max = w.iter().cloned().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
        assert!(w.iter().all(|&x| x > 0.0 && x <= 1.0));
    }

    #[test]
    fn test_update_last_priorities_and_beta_anneal() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut buffer = prioritized(4);
        for i in 0..4 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        assert!((buffer.beta() - 0.4).abs() < 1e-12);
        let batch = buffer.sample(2, &mut rng).unwrap();
        buffer.update_last_priorities(&[0.0, 5.0]).unwrap();
        // zero priorities are clamped to stay strictly positive
        assert!(buffer.priority_mass(batch.indices[0]).unwrap() > 0.0);
        assert!(buffer.beta() > 0.4);
        assert!(buffer.update_last_priorities(&[1.0]).is_err());
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        let mut buffer = ReplayBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.add(make_transition(i as f32, false)).unwrap();
        }
        buffer.save(&path).unwrap();
        let loaded = ReplayBuffer::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(rewards(&loaded), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_average_reward() {
        let mut buffer = ReplayBuffer::with_capacity(10);
        for r in [1.0f32, 2.0, 3.0] {
            buffer.add(make_transition(r, false)).unwrap();
        }
        assert!((buffer.average_reward() - 2.0).abs() < 1e-9);
    }
}
