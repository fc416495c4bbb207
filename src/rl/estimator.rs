//! Value estimator strategies and auxiliary objectives.
//!
//! The agent is parameterised over how it turns network outputs into a
//! loss: [`ScalarEstimator`] (DQN / double-DQN expectation targets) or
//! [`QuantileEstimator`] (IQN quantile targets). Auxiliary objectives hook
//! extra losses into the same training step and report them by name.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::{Rng, RngCore};

use crate::config::{AgentVariant, ExperimentConfig, QuantileConfig};
use crate::error::{Result, TraderError};

use super::data::{StateBatch, TransitionBatch};
use super::network::{ParamStore, QNetwork};
use super::targets::{
    gather_actions, greedy_actions, quantile_huber_loss, quantile_targets, scalar_targets,
    smooth_l1_loss,
};

/// Result of evaluating the loss on one batch.
#[derive(Debug, Clone)]
pub struct EstimatorOutput {
    pub loss: f32,
    /// Batch mean absolute TD error
    pub td_error: f32,
    /// Per-sample TD error used as the replay priority signal
    pub sample_td: Array1<f32>,
    pub qt_mean: f32,
    pub gt_mean: f32,
    /// `dL/d(network output)`, same shape as the behaviour forward pass
    pub grad_output: Array4<f32>,
}

pub trait ValueEstimator<N: QNetwork> {
    fn name(&self) -> &'static str;

    /// Action values `[batch, assets, atoms]` used for greedy selection.
    fn q_values(&self, net: &N, states: &StateBatch, rng: &mut dyn RngCore)
        -> Result<Array3<f32>>;

    fn greedy(&self, net: &N, states: &StateBatch, rng: &mut dyn RngCore) -> Result<Array2<usize>> {
        Ok(greedy_actions(&self.q_values(net, states, rng)?))
    }

    /// Forward the behaviour network in training mode and compute the loss
    /// and its gradient w.r.t. the behaviour output. Targets use the target
    /// network without caching.
    fn loss(
        &self,
        behaviour: &mut N,
        target: &N,
        batch: &TransitionBatch,
        rng: &mut dyn RngCore,
    ) -> Result<EstimatorOutput>;

    /// Whether per-sample TD errors are written back as replay priorities.
    fn writes_priorities(&self) -> bool;
}

/// Build the estimator for the configured agent variant.
pub fn estimator_for<N: QNetwork + 'static>(config: &ExperimentConfig) -> Box<dyn ValueEstimator<N>> {
    let op = &config.off_policy;
    let gamma_n = op.discount.powi(op.nstep_return as i32) as f32;
    match &config.agent {
        AgentVariant::Dqn => Box::new(ScalarEstimator {
            gamma_n,
            double_dqn: op.double_dqn,
        }),
        AgentVariant::Iqn(q) => Box::new(QuantileEstimator {
            gamma_n,
            double_dqn: op.double_dqn,
            quantiles: q.clone(),
        }),
    }
}

/// Scatter `grad[b, k, a]` onto the taken action of each asset.
fn masked_grad(
    shape: &[usize],
    actions: &Array2<usize>,
    grad: impl Fn(usize, usize, usize) -> f32,
) -> Result<Array4<f32>> {
    let (bs, n_tau, assets, atoms) = (shape[0], shape[1], shape[2], shape[3]);
    if actions.dim() != (bs, assets) {
        return Err(TraderError::shape(format!(
            "actions {:?} do not match output batch {} x {} assets",
            actions.dim(),
            bs,
            assets
        )));
    }
    let mut out = Array4::zeros((bs, n_tau, assets, atoms));
    for b in 0..bs {
        for k in 0..n_tau {
            for a in 0..assets {
                let act = actions[[b, a]];
                if act >= atoms {
                    return Err(TraderError::shape(format!(
                        "action {} outside [0, {})",
                        act, atoms
                    )));
                }
                out[[b, k, a, act]] = grad(b, k, a);
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Scalar (DQN)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ScalarEstimator {
    /// `discount ^ nstep_return`
    pub gamma_n: f32,
    pub double_dqn: bool,
}

fn single_quantile(out: Array4<f32>) -> Array3<f32> {
    out.index_axis_move(Axis(1), 0)
}

impl<N: QNetwork> ValueEstimator<N> for ScalarEstimator {
    fn name(&self) -> &'static str {
        "DQN"
    }

    fn q_values(
        &self,
        net: &N,
        states: &StateBatch,
        _rng: &mut dyn RngCore,
    ) -> Result<Array3<f32>> {
        Ok(single_quantile(net.forward(states, None)?))
    }

    fn loss(
        &self,
        behaviour: &mut N,
        target: &N,
        batch: &TransitionBatch,
        _rng: &mut dyn RngCore,
    ) -> Result<EstimatorOutput> {
        let out = behaviour.forward_train(&batch.states, None)?;
        let out_shape = out.shape().to_vec();
        let q = single_quantile(out);
        let qt = gather_actions(&q, &batch.actions);

        let next_target = single_quantile(target.forward(&batch.next_states, None)?);
        let next_actions = if self.double_dqn {
            greedy_actions(&single_quantile(behaviour.forward(&batch.next_states, None)?))
        } else {
            greedy_actions(&next_target)
        };
        let next_values = gather_actions(&next_target, &next_actions);
        let gt = scalar_targets(&batch.rewards, &batch.dones, &next_values, self.gamma_n)?;
        assert_eq!(qt.shape(), gt.shape(), "Qt and Gt shapes differ");

        let (loss, grad) = smooth_l1_loss(&qt, &gt);
        let grad_output = masked_grad(&out_shape, &batch.actions, |b, _, a| grad[[b, a]])?;
        let abs_td = (&gt - &qt).mapv(f32::abs);
        let sample_td = abs_td
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(qt.nrows()));

        Ok(EstimatorOutput {
            loss,
            td_error: abs_td.mean().unwrap_or(0.0),
            sample_td,
            qt_mean: qt.mean().unwrap_or(0.0),
            gt_mean: gt.mean().unwrap_or(0.0),
            grad_output,
        })
    }

    fn writes_priorities(&self) -> bool {
        false
    }
}

// =============================================================================
// Quantile (IQN)
// =============================================================================

#[derive(Debug, Clone)]
pub struct QuantileEstimator {
    pub gamma_n: f32,
    pub double_dqn: bool,
    pub quantiles: QuantileConfig,
}

impl QuantileEstimator {
    fn sample_taus(bs: usize, n: usize, rng: &mut dyn RngCore) -> Array2<f32> {
        Array2::from_shape_fn((bs, n), |_| rng.gen::<f32>())
    }

    /// Fractions for greedy selection, passed through the risk distortion.
    fn greedy_taus(&self, bs: usize, rng: &mut dyn RngCore) -> Array2<f32> {
        let risk = self.quantiles.risk_distortion;
        Self::sample_taus(bs, self.quantiles.n_tau1, rng).mapv(|t| risk.apply(t))
    }
}

/// `mean_assets(z[b, k, a, actions[b, a]])` -> `[batch, n_tau]`
fn action_quantiles(z: &Array4<f32>, actions: &Array2<usize>) -> Array2<f32> {
    let (bs, n_tau, assets, _) = z.dim();
    Array2::from_shape_fn((bs, n_tau), |(b, k)| {
        (0..assets).map(|a| z[[b, k, a, actions[[b, a]]]]).sum::<f32>() / assets as f32
    })
}

fn mean_over_taus(z: &Array4<f32>) -> Result<Array3<f32>> {
    z.mean_axis(Axis(1))
        .ok_or_else(|| TraderError::shape("quantile output has no fractions"))
}

impl<N: QNetwork> ValueEstimator<N> for QuantileEstimator {
    fn name(&self) -> &'static str {
        "IQN"
    }

    fn q_values(&self, net: &N, states: &StateBatch, rng: &mut dyn RngCore) -> Result<Array3<f32>> {
        let taus = self.greedy_taus(states.len(), rng);
        mean_over_taus(&net.forward(states, Some(&taus))?)
    }

    fn loss(
        &self,
        behaviour: &mut N,
        target: &N,
        batch: &TransitionBatch,
        rng: &mut dyn RngCore,
    ) -> Result<EstimatorOutput> {
        let bs = batch.len();
        let taus1 = Self::sample_taus(bs, self.quantiles.n_tau1, rng);
        let taus2 = Self::sample_taus(bs, self.quantiles.n_tau2, rng);
        let greedy_taus = self.greedy_taus(bs, rng);

        let z = behaviour.forward_train(&batch.states, Some(&taus1))?;
        let qt = action_quantiles(&z, &batch.actions);

        let selector: &N = if self.double_dqn { &*behaviour } else { target };
        let next_actions =
            greedy_actions(&mean_over_taus(&selector.forward(&batch.next_states, Some(&greedy_taus))?)?);
        let z_next = target.forward(&batch.next_states, Some(&taus2))?;
        let next_values = action_quantiles(&z_next, &next_actions);
        let gt = quantile_targets(&batch.rewards, &batch.dones, &next_values, self.gamma_n)?;
        assert_eq!(qt.nrows(), gt.nrows(), "Qt and Gt batch sizes differ");

        let ql = quantile_huber_loss(
            &qt,
            &gt,
            &taus1,
            self.quantiles.k_huber,
            batch.weights.as_ref(),
        );
        let assets = z.shape()[2] as f32;
        let grad_output =
            masked_grad(z.shape(), &batch.actions, |b, k, _| ql.grad_qt[[b, k]] / assets)?;

        Ok(EstimatorOutput {
            loss: ql.loss,
            td_error: ql.td_error.mean().unwrap_or(0.0),
            sample_td: ql.td_error,
            qt_mean: qt.mean().unwrap_or(0.0),
            gt_mean: gt.mean().unwrap_or(0.0),
            grad_output,
        })
    }

    fn writes_priorities(&self) -> bool {
        true
    }
}

// =============================================================================
// Auxiliary objectives
// =============================================================================

/// Extra loss evaluated alongside the value loss (autoencoding, contrastive).
/// Implementations add their gradients into `grads` and return named losses
/// that end up in the step metrics.
pub trait AuxiliaryObjective<N: QNetwork> {
    fn name(&self) -> &'static str;

    fn apply(
        &mut self,
        network: &mut N,
        batch: &TransitionBatch,
        grads: &mut ParamStore,
    ) -> Result<BTreeMap<String, f32>>;
}

/// No auxiliary loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuxiliary;

impl<N: QNetwork> AuxiliaryObjective<N> for NoAuxiliary {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(
        &mut self,
        _network: &mut N,
        _batch: &TransitionBatch,
        _grads: &mut ParamStore,
    ) -> Result<BTreeMap<String, f32>> {
        Ok(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputShape;
    use crate::rl::data::{Observation, Transition};
    use crate::rl::network::{MlpQNetwork, NetworkSpec};
    use ndarray::{Array1, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn spec(n_cos: Option<usize>) -> NetworkSpec {
        NetworkSpec {
            input_shape: InputShape {
                window: 2,
                features: 1,
            },
            n_assets: 2,
            action_atoms: 3,
            d_model: 8,
            n_cos,
            noisy_sigma: None,
        }
    }

    fn batch(done: bool, reward: f32) -> TransitionBatch {
        let transitions: Vec<Transition> = (0..4)
            .map(|i| {
                let obs = Observation::new(
                    Array3::from_elem((2, 1, 2), i as f32 * 0.1),
                    Array1::from_elem(3, 0.5),
                    i,
                );
                Transition::new(obs.clone(), vec![i as usize % 3, 2], vec![reward], obs, done)
            })
            .collect();
        let refs: Vec<&Transition> = transitions.iter().collect();
        TransitionBatch::from_transitions(&refs).unwrap()
    }

    #[test]
    fn test_scalar_terminal_targets_are_rewards() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut behaviour = MlpQNetwork::new(spec(None), &mut rng).unwrap();
        let target = behaviour.clone();
        let est = ScalarEstimator {
            gamma_n: 0.99,
            double_dqn: true,
        };
        let out = est.loss(&mut behaviour, &target, &batch(true, 0.75), &mut rng).unwrap();
        assert!((out.gt_mean - 0.75).abs() < 1e-6);
        assert_eq!(out.sample_td.len(), 4);
        assert!(out.loss >= 0.0);
    }

    #[test]
    fn test_scalar_gradient_only_on_taken_actions() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut behaviour = MlpQNetwork::new(spec(None), &mut rng).unwrap();
        let target = behaviour.clone();
        let est = ScalarEstimator {
            gamma_n: 0.9,
            double_dqn: false,
        };
        let b = batch(false, 1.0);
        let out = est.loss(&mut behaviour, &target, &b, &mut rng).unwrap();
        assert_eq!(out.grad_output.shape(), &[4, 1, 2, 3]);
        for ((bi, _, a, k), &g) in out.grad_output.indexed_iter() {
            if k != b.actions[[bi, a]] {
                assert_eq!(g, 0.0);
            }
        }
        // cached activations are consumed by backward
        assert!(behaviour.backward(&out.grad_output).is_ok());
    }

    #[test]
    fn test_quantile_loss_shapes() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut behaviour = MlpQNetwork::new(spec(Some(4)), &mut rng).unwrap();
        let target = behaviour.clone();
        let est = QuantileEstimator {
            gamma_n: 0.99,
            double_dqn: true,
            quantiles: QuantileConfig {
                n_tau1: 5,
                n_tau2: 7,
                ..Default::default()
            },
        };
        let b = batch(false, 0.1);
        let out = est.loss(&mut behaviour, &target, &b, &mut rng).unwrap();
        assert_eq!(out.grad_output.shape(), &[4, 5, 2, 3]);
        assert_eq!(out.sample_td.len(), 4);
        assert!(out.sample_td.iter().all(|&x| x >= 0.0));
        assert!(out.loss.is_finite());

        let q = est.q_values(&behaviour, &b.states, &mut rng).unwrap();
        assert_eq!(q.shape(), &[4, 2, 3]);
        assert!(<QuantileEstimator as ValueEstimator<MlpQNetwork>>::writes_priorities(&est));
    }

    #[test]
    fn test_quantile_terminal_targets_sum_rewards() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut behaviour = MlpQNetwork::new(spec(Some(4)), &mut rng).unwrap();
        let target = behaviour.clone();
        let est = QuantileEstimator {
            gamma_n: 0.99,
            double_dqn: false,
            quantiles: QuantileConfig::default(),
        };
        let out = est.loss(&mut behaviour, &target, &batch(true, 0.4), &mut rng).unwrap();
        assert!((out.gt_mean - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_estimator_for_variant() {
        let mut config = ExperimentConfig::new("x", "/tmp");
        let dqn: Box<dyn ValueEstimator<MlpQNetwork>> = estimator_for(&config);
        assert_eq!(dqn.name(), "DQN");
        assert!(!dqn.writes_priorities());
        config.agent = AgentVariant::Iqn(QuantileConfig::default());
        let iqn: Box<dyn ValueEstimator<MlpQNetwork>> = estimator_for(&config);
        assert_eq!(iqn.name(), "IQN");
    }
}
