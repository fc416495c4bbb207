//! Exploration policy: noisy networks or epsilon-greedy.
//!
//! In noisy mode the behaviour network's resampled weight noise does the
//! exploring and every decision is greedy; `eps` is left alone. In
//! epsilon-greedy mode a uniform random action is taken with probability
//! `eps`, and `eps` decays geometrically toward `eps_min` after each
//! decision.

use rand::Rng;

use crate::config::OffPolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorationMode {
    NoisyNet,
    EpsilonGreedy,
}

/// What the agent should do for the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Greedy,
    Random(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct ExplorationPolicy {
    mode: ExplorationMode,
    eps_decay: f64,
    eps_min: f64,
}

/// A decay configured as its complement (e.g. `1e-6` for `0.999999`) is
/// folded back so the factor is always the larger of the two.
pub fn canonical_decay(decay: f64) -> f64 {
    decay.max(1.0 - decay)
}

impl ExplorationPolicy {
    pub fn new(config: &OffPolicyConfig) -> Self {
        Self {
            mode: if config.noisy_net {
                ExplorationMode::NoisyNet
            } else {
                ExplorationMode::EpsilonGreedy
            },
            eps_decay: canonical_decay(config.eps_decay),
            eps_min: config.eps_min,
        }
    }

    pub fn mode(&self) -> ExplorationMode {
        self.mode
    }

    pub fn eps_decay(&self) -> f64 {
        self.eps_decay
    }

    /// One decay step. Never raises `eps`.
    pub fn decay(&self, eps: f64) -> f64 {
        if eps > self.eps_min {
            (eps * self.eps_decay).max(self.eps_min)
        } else {
            eps
        }
    }

    /// Decide between a greedy and a uniformly random action, updating
    /// `eps` in epsilon-greedy mode.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        eps: &mut f64,
        n_assets: usize,
        action_atoms: usize,
        rng: &mut R,
    ) -> Decision {
        match self.mode {
            ExplorationMode::NoisyNet => Decision::Greedy,
            ExplorationMode::EpsilonGreedy => {
                let decision = if rng.gen::<f64>() < *eps {
                    Decision::Random((0..n_assets).map(|_| rng.gen_range(0..action_atoms)).collect())
                } else {
                    Decision::Greedy
                };
                *eps = self.decay(*eps);
                decision
            }
        }
    }
}
