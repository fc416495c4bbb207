//! Typed experiment configuration.
//!
//! One JSON document describes an experiment: the agent variant (tagged
//! `Dqn` / `Iqn`), the off-policy hyperparameters shared by every variant,
//! the reference model and optimizer settings and the orchestration schedule.
//! Unknown keys are rejected at load time and `validate()` runs before any
//! agent is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TraderError};

// =============================================================================
// Agent variants
// =============================================================================

/// Agent variant. Variant-specific settings live inside the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentVariant {
    /// Scalar expected-value targets (DQN / double-DQN)
    Dqn,
    /// Distributional quantile targets (IQN)
    Iqn(QuantileConfig),
}

impl AgentVariant {
    pub fn name(&self) -> &'static str {
        match self {
            AgentVariant::Dqn => "DQN",
            AgentVariant::Iqn(_) => "IQN",
        }
    }
}

/// Risk distortion applied to the greedy-selection quantile fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RiskDistortion {
    /// Risk neutral: fractions used as drawn
    Identity,
    /// Conditional value at risk: tau -> eta * tau
    Cvar { eta: f32 },
}

impl Default for RiskDistortion {
    fn default() -> Self {
        Self::Identity
    }
}

impl RiskDistortion {
    pub fn apply(&self, tau: f32) -> f32 {
        match *self {
            RiskDistortion::Identity => tau,
            RiskDistortion::Cvar { eta } => tau * eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantileConfig {
    /// Quantile fractions for the current-state estimate
    pub n_tau1: usize,
    /// Quantile fractions for the bootstrap target
    pub n_tau2: usize,
    /// Quantile Huber threshold
    pub k_huber: f32,
    #[serde(default)]
    pub risk_distortion: RiskDistortion,
}

impl Default for QuantileConfig {
    fn default() -> Self {
        Self {
            n_tau1: 32,
            n_tau2: 32,
            k_huber: 1.0,
            risk_distortion: RiskDistortion::Identity,
        }
    }
}

// =============================================================================
// Shared off-policy settings
// =============================================================================

/// Reward shaping constants. The shaped reward is
/// `ln(max(offset + equity_change / prev_equity, floor))` per asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RewardConfig {
    pub offset: f64,
    pub floor: f64,
    /// Sum per-asset rewards into a single scalar
    pub reduce: bool,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            offset: 1.0,
            floor: 0.35,
            reduce: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OffPolicyConfig {
    pub discount: f64,
    pub nstep_return: usize,
    pub replay_size: usize,
    pub replay_min_size: usize,
    pub batch_size: usize,
    pub prioritized_replay: bool,
    pub per_alpha: f64,
    pub per_beta: f64,
    /// Samples over which beta anneals to 1.0 (0 disables annealing)
    pub per_beta_steps: u64,
    pub noisy_net: bool,
    pub noisy_net_sigma: f32,
    pub eps: f64,
    pub eps_decay: f64,
    pub eps_min: f64,
    pub double_dqn: bool,
    pub tau_soft_update: f64,
    /// When set, the target network is hard-copied every N training steps
    /// instead of being soft-updated after each step.
    pub hard_update_every: Option<u64>,
    /// Proportion of available margin used as one trade unit
    pub unit_size: f64,
    /// Drop trades that add to an open position in the same direction
    pub filter_doubling: bool,
    pub test_steps: usize,
    pub reward: RewardConfig,
}

impl Default for OffPolicyConfig {
    fn default() -> Self {
        Self {
            discount: 0.99,
            nstep_return: 1,
            replay_size: 100_000,
            replay_min_size: 10_000,
            batch_size: 32,
            prioritized_replay: false,
            per_alpha: 0.6,
            per_beta: 0.4,
            per_beta_steps: 100_000,
            noisy_net: true,
            noisy_net_sigma: 0.5,
            eps: 1.0,
            eps_decay: 0.999_999,
            eps_min: 0.1,
            double_dqn: true,
            tau_soft_update: 1e-4,
            hard_update_every: None,
            unit_size: 0.01,
            filter_doubling: false,
            test_steps: 1_000,
            reward: RewardConfig::default(),
        }
    }
}

// =============================================================================
// Model / optimizer / orchestration
// =============================================================================

/// Settings for the reference MLP network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelConfig {
    pub d_model: usize,
    /// Cosine basis size for the quantile embedding
    pub n_cos: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            n_cos: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OptimConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub max_grad_norm: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrainerConfig {
    pub train_steps: u64,
    /// Training steps between metric batches
    pub log_freq: u64,
    /// Environment steps between test episodes
    pub test_freq: u64,
    /// Environment steps between checkpoints
    pub model_save_freq: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_steps: 1_000_000,
            log_freq: 10_000,
            test_freq: 32_000,
            model_save_freq: 64_000,
        }
    }
}

/// Observation window layout: `price` is `[window, features, n_assets]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputShape {
    pub window: usize,
    pub features: usize,
}

// =============================================================================
// Experiment
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub basepath: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    pub n_assets: usize,
    pub action_atoms: usize,
    pub input_shape: InputShape,
    pub agent: AgentVariant,
    #[serde(default)]
    pub off_policy: OffPolicyConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

impl ExperimentConfig {
    /// Minimal configuration used as a starting point by tests and tools.
    pub fn new(experiment_id: impl Into<String>, basepath: impl Into<PathBuf>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            basepath: basepath.into(),
            seed: None,
            n_assets: 1,
            action_atoms: 3,
            input_shape: InputShape {
                window: 8,
                features: 1,
            },
            agent: AgentVariant::Dqn,
            off_policy: OffPolicyConfig::default(),
            model: ModelConfig::default(),
            optim: OptimConfig::default(),
            trainer: TrainerConfig::default(),
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| TraderError::io(path, e))?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| TraderError::io(path, e))
    }

    /// Directory holding `{branch}.json` checkpoints.
    pub fn savepath(&self) -> PathBuf {
        self.basepath.join(&self.experiment_id).join("models")
    }

    /// Check cross-field constraints. Called by every constructor that
    /// consumes a config.
    pub fn validate(&self) -> Result<()> {
        let op = &self.off_policy;
        if self.n_assets == 0 {
            return Err(TraderError::config("n_assets must be positive"));
        }
        if self.action_atoms < 2 {
            return Err(TraderError::config(format!(
                "action_atoms must be at least 2, got {}",
                self.action_atoms
            )));
        }
        if self.input_shape.window == 0 || self.input_shape.features == 0 {
            return Err(TraderError::config("input_shape dimensions must be positive"));
        }
        if !(op.discount > 0.0 && op.discount <= 1.0) {
            return Err(TraderError::config(format!(
                "discount must lie in (0, 1], got {}",
                op.discount
            )));
        }
        if op.nstep_return == 0 {
            return Err(TraderError::config("nstep_return must be at least 1"));
        }
        if op.batch_size == 0 {
            return Err(TraderError::config("batch_size must be positive"));
        }
        if op.replay_min_size < op.batch_size {
            return Err(TraderError::config(format!(
                "replay_min_size ({}) must be >= batch_size ({})",
                op.replay_min_size, op.batch_size
            )));
        }
        if op.replay_size <= op.replay_min_size {
            return Err(TraderError::config(format!(
                "replay_size ({}) must exceed replay_min_size ({})",
                op.replay_size, op.replay_min_size
            )));
        }
        if !(0.0..=1.0).contains(&op.eps) || !(0.0..=1.0).contains(&op.eps_min) {
            return Err(TraderError::config("eps and eps_min must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&op.eps_decay) {
            return Err(TraderError::config("eps_decay must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&op.tau_soft_update) {
            return Err(TraderError::config("tau_soft_update must lie in [0, 1]"));
        }
        if op.hard_update_every == Some(0) {
            return Err(TraderError::config("hard_update_every must be positive"));
        }
        if op.prioritized_replay && (op.per_alpha < 0.0 || !(0.0..=1.0).contains(&op.per_beta))
        {
            return Err(TraderError::config(
                "per_alpha must be >= 0 and per_beta must lie in [0, 1]",
            ));
        }
        if op.unit_size <= 0.0 {
            return Err(TraderError::config("unit_size must be positive"));
        }
        if self.trainer.log_freq == 0 {
            return Err(TraderError::config("trainer.log_freq must be positive"));
        }
        if op.reward.floor <= 0.0 {
            return Err(TraderError::config("reward floor must be positive"));
        }
        if let AgentVariant::Iqn(q) = &self.agent {
            if q.n_tau1 == 0 || q.n_tau2 == 0 {
                return Err(TraderError::config("n_tau1 and n_tau2 must be positive"));
            }
            if q.k_huber <= 0.0 {
                return Err(TraderError::config("k_huber must be positive"));
            }
            if let RiskDistortion::Cvar { eta } = q.risk_distortion {
                if !(eta > 0.0 && eta <= 1.0) {
                    return Err(TraderError::config(format!(
                        "CVaR eta must lie in (0, 1], got {}",
                        eta
                    )));
                }
            }
        }
        if self.model.d_model == 0 || self.model.n_cos == 0 {
            return Err(TraderError::config("model dimensions must be positive"));
        }
        Ok(())
    }
}
