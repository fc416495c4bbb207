//! Experience records and stacked training batches.
//!
//! An [`Observation`] is the windowed view produced by the preprocessor, a
//! [`Transition`] is one SARSD tuple, and [`TransitionBatch`] stacks sampled
//! transitions along a leading batch axis so value estimators can work on
//! whole arrays.

use ndarray::{stack, Array1, Array2, Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::config::InputShape;
use crate::error::{Result, TraderError};

/// Structured observation: `price` is `[time, features, assets]`,
/// `portfolio` is `[assets + 1]` (normalised holdings plus cash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub price: Array3<f32>,
    pub portfolio: Array1<f32>,
    pub timestamp: i64,
}

impl Observation {
    pub fn new(price: Array3<f32>, portfolio: Array1<f32>, timestamp: i64) -> Self {
        Self {
            price,
            portfolio,
            timestamp,
        }
    }

    pub fn zeros(shape: InputShape, n_assets: usize) -> Self {
        Self {
            price: Array3::zeros((shape.window, shape.features, n_assets)),
            portfolio: Array1::zeros(n_assets + 1),
            timestamp: 0,
        }
    }

    pub fn n_assets(&self) -> usize {
        self.price.shape()[2]
    }

    /// Verify this observation matches the configured layout.
    pub fn check_shape(&self, shape: InputShape, n_assets: usize) -> Result<()> {
        let expected = [shape.window, shape.features, n_assets];
        if self.price.shape() != expected {
            return Err(TraderError::shape(format!(
                "price shape {:?} does not match configured {:?}",
                self.price.shape(),
                expected
            )));
        }
        if self.portfolio.len() != n_assets + 1 {
            return Err(TraderError::shape(format!(
                "portfolio length {} does not match n_assets + 1 = {}",
                self.portfolio.len(),
                n_assets + 1
            )));
        }
        Ok(())
    }
}

/// Single experience tuple (s, a, r, s', done)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Observation,
    /// One action index per asset
    pub action: Vec<usize>,
    /// Per-asset reward, or a single reduced value
    pub reward: Vec<f32>,
    pub next_state: Observation,
    pub done: bool,
}

impl Transition {
    pub fn new(
        state: Observation,
        action: Vec<usize>,
        reward: Vec<f32>,
        next_state: Observation,
        done: bool,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            done,
        }
    }

    pub fn total_reward(&self) -> f32 {
        self.reward.iter().sum()
    }
}

// =============================================================================
// Batches
// =============================================================================

/// Observations stacked along a leading batch axis.
#[derive(Debug, Clone)]
pub struct StateBatch {
    /// `[batch, time, features, assets]`
    pub price: Array4<f32>,
    /// `[batch, assets + 1]`
    pub portfolio: Array2<f32>,
    pub timestamps: Vec<i64>,
}

impl StateBatch {
    pub fn from_observations(observations: &[&Observation]) -> Result<Self> {
        if observations.is_empty() {
            return Err(TraderError::shape("cannot stack an empty batch"));
        }
        let prices: Vec<ArrayView3<f32>> = observations.iter().map(|o| o.price.view()).collect();
        let ports: Vec<_> = observations.iter().map(|o| o.portfolio.view()).collect();
        let price = stack(Axis(0), &prices)
            .map_err(|e| TraderError::shape(format!("stacking price windows: {}", e)))?;
        let portfolio = stack(Axis(0), &ports)
            .map_err(|e| TraderError::shape(format!("stacking portfolios: {}", e)))?;
        Ok(Self {
            price,
            portfolio,
            timestamps: observations.iter().map(|o| o.timestamp).collect(),
        })
    }

    /// Batch of one, used for acting.
    pub fn single(observation: &Observation) -> Self {
        Self {
            price: observation.price.clone().insert_axis(Axis(0)),
            portfolio: observation.portfolio.clone().insert_axis(Axis(0)),
            timestamps: vec![observation.timestamp],
        }
    }

    pub fn len(&self) -> usize {
        self.price.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[batch, time*features*assets + assets + 1]` row-major features.
    pub fn flatten(&self) -> Array2<f32> {
        let bs = self.len();
        let price_len = self.price.len() / bs.max(1);
        let port_len = self.portfolio.shape()[1];
        let mut out = Array2::zeros((bs, price_len + port_len));
        for b in 0..bs {
            let mut row = out.row_mut(b);
            for (dst, src) in row.iter_mut().zip(
                self.price
                    .index_axis(Axis(0), b)
                    .iter()
                    .chain(self.portfolio.row(b).iter()),
            ) {
                *dst = *src;
            }
        }
        out
    }
}

/// Stacked transitions ready for a training step.
#[derive(Debug, Clone)]
pub struct TransitionBatch {
    pub states: StateBatch,
    /// `[batch, assets]`
    pub actions: Array2<usize>,
    /// `[batch, reward_len]`
    pub rewards: Array2<f32>,
    pub next_states: StateBatch,
    pub dones: Array1<bool>,
    /// Importance-sampling weights (prioritized replay only)
    pub weights: Option<Array1<f32>>,
    /// Buffer slots the batch was drawn from
    pub indices: Vec<usize>,
}

impl TransitionBatch {
    pub fn from_transitions(transitions: &[&Transition]) -> Result<Self> {
        let first = transitions
            .first()
            .ok_or_else(|| TraderError::shape("cannot build an empty transition batch"))?;
        let n_act = first.action.len();
        let n_rew = first.reward.len();
        let bs = transitions.len();

        let mut actions = Array2::zeros((bs, n_act));
        let mut rewards = Array2::zeros((bs, n_rew));
        let mut dones = Array1::from_elem(bs, false);
        for (b, t) in transitions.iter().enumerate() {
            if t.action.len() != n_act || t.reward.len() != n_rew {
                return Err(TraderError::shape(format!(
                    "transition {} has action/reward lengths ({}, {}), expected ({}, {})",
                    b,
                    t.action.len(),
                    t.reward.len(),
                    n_act,
                    n_rew
                )));
            }
            for (i, &a) in t.action.iter().enumerate() {
                actions[[b, i]] = a;
            }
            for (i, &r) in t.reward.iter().enumerate() {
                rewards[[b, i]] = r;
            }
            dones[b] = t.done;
        }

        let states: Vec<&Observation> = transitions.iter().map(|t| &t.state).collect();
        let next_states: Vec<&Observation> = transitions.iter().map(|t| &t.next_state).collect();
        Ok(Self {
            states: StateBatch::from_observations(&states)?,
            actions,
            rewards,
            next_states: StateBatch::from_observations(&next_states)?,
            dones,
            weights: None,
            indices: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.dones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dones.is_empty()
    }
}
