//! Adam optimizer over named parameter tensors.
//!
//! Moments are kept per parameter name so the optimizer state can be stored
//! in a checkpoint next to the weights and restored on resume:
//!
//! ```text
//! m = beta1 * m + (1 - beta1) * g
//! v = beta2 * v + (1 - beta2) * g^2
//! p = p - lr * m_hat / (sqrt(v_hat) + eps)
//! ```

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::config::OptimConfig;
use crate::error::{Result, TraderError};

use super::network::ParamStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    /// First moment estimates
    m: ParamStore,
    /// Second moment estimates
    v: ParamStore,
    /// Steps taken, for bias correction
    t: u64,
}

impl Adam {
    pub fn new(config: &OptimConfig) -> Self {
        Self {
            learning_rate: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.eps,
            m: ParamStore::new(),
            v: ParamStore::new(),
            t: 0,
        }
    }

    pub fn timestep(&self) -> u64 {
        self.t
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Count a step taken by a backend with its own optimizer.
    pub fn record_step(&mut self) {
        self.t += 1;
    }

    /// Update `params` in place from `grads`. Names missing from `grads`
    /// are left untouched.
    pub fn step(&mut self, params: &mut ParamStore, grads: &ParamStore) -> Result<()> {
        for (name, g) in grads.iter() {
            match params.get(name) {
                Some(p) if p.shape() == g.shape() => {}
                Some(p) => {
                    return Err(TraderError::shape(format!(
                        "gradient for '{}' has shape {:?}, parameter is {:?}",
                        name,
                        g.shape(),
                        p.shape()
                    )))
                }
                None => {
                    return Err(TraderError::shape(format!(
                        "gradient for unknown parameter '{}'",
                        name
                    )))
                }
            }
        }

        if self.m.check_compatible(&params.zeros_like()).is_err() {
            self.m = params.zeros_like();
            self.v = params.zeros_like();
        }

        self.t += 1;
        let bias_correction1 = bias_correction(self.beta1, self.t);
        let bias_correction2 = bias_correction(self.beta2, self.t);
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.learning_rate, self.epsilon);

        for (name, p) in params.iter_mut() {
            let (g, m, v) = match (grads.get(name), self.m.get_mut(name), self.v.get_mut(name)) {
                (Some(g), Some(m), Some(v)) => (g, m, v),
                _ => continue,
            };
            Zip::from(p).and(g).and(m).and(v).for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
        Ok(())
    }
}

/// `1 - beta^t` for any step count.
fn bias_correction(beta: f32, t: u64) -> f32 {
    1.0 - beta.powf(t as f32)
}

/// Rescale `grads` so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut ParamStore, max_norm: f32) -> f32 {
    let total = grads.global_norm();
    if total.is_finite() && total > max_norm && total > 0.0 {
        grads.scale(max_norm / (total + 1e-6));
    }
    total
}
