//! Bootstrapped value targets and their losses.
//!
//! Everything here works on plain arrays so it can be tested without a
//! network. Shapes follow the network output convention with the quantile
//! axis already reduced or selected by the caller:
//! - scalar path: `Qt`, `Gt` are `[batch, assets]`
//! - quantile path: `Qt` is `[batch, n_tau1]`, `Gt` is `[batch, n_tau2]`

use ndarray::{Array1, Array2, Array3, Axis};

use crate::error::{Result, TraderError};

/// Argmax over the trailing action axis of `[batch, assets, atoms]`.
pub fn greedy_actions(q: &Array3<f32>) -> Array2<usize> {
    let (bs, assets, _) = q.dim();
    Array2::from_shape_fn((bs, assets), |(b, a)| {
        let mut best = 0;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in q.slice(ndarray::s![b, a, ..]).iter().enumerate() {
            if v > best_val {
                best = i;
                best_val = v;
            }
        }
        best
    })
}

/// Gather `values[b, a, actions[b, a]]`.
pub fn gather_actions(values: &Array3<f32>, actions: &Array2<usize>) -> Array2<f32> {
    Array2::from_shape_fn(actions.dim(), |(b, a)| values[[b, a, actions[[b, a]]]])
}

/// Reward for asset `a`: per-asset rewards index directly, a single reduced
/// reward is shared by every asset.
fn reward_for(rewards: &Array2<f32>, b: usize, a: usize) -> f32 {
    if rewards.ncols() == 1 {
        rewards[[b, 0]]
    } else {
        rewards[[b, a]]
    }
}

/// Scalar n-step target
/// `Gt = r + (1 - done) * gamma_n * Q_target(s', a*)`, `[batch, assets]`.
pub fn scalar_targets(
    rewards: &Array2<f32>,
    dones: &Array1<bool>,
    next_values: &Array2<f32>,
    gamma_n: f32,
) -> Result<Array2<f32>> {
    let (bs, assets) = next_values.dim();
    if rewards.nrows() != bs || dones.len() != bs {
        return Err(TraderError::shape(format!(
            "batch of {} next values with {} rewards and {} dones",
            bs,
            rewards.nrows(),
            dones.len()
        )));
    }
    if rewards.ncols() != 1 && rewards.ncols() != assets {
        return Err(TraderError::shape(format!(
            "reward width {} is neither 1 nor the asset count {}",
            rewards.ncols(),
            assets
        )));
    }
    Ok(Array2::from_shape_fn((bs, assets), |(b, a)| {
        let bootstrap = if dones[b] { 0.0 } else { gamma_n * next_values[[b, a]] };
        reward_for(rewards, b, a) + bootstrap
    }))
}

/// Smooth L1 (Huber, delta = 1) averaged over every element.
/// Returns the loss and `dL/dQt`.
pub fn smooth_l1_loss(qt: &Array2<f32>, gt: &Array2<f32>) -> (f32, Array2<f32>) {
    assert_eq!(qt.shape(), gt.shape(), "Qt and Gt must have the same shape");
    let count = qt.len().max(1) as f32;
    let diff = qt - gt;
    let loss = diff
        .iter()
        .map(|&d| if d.abs() < 1.0 { 0.5 * d * d } else { d.abs() - 0.5 })
        .sum::<f32>()
        / count;
    let grad = diff.mapv(|d| d.clamp(-1.0, 1.0) / count);
    (loss, grad)
}

/// Distributional n-step target per fraction:
/// `Gt[b, j] = sum(r_b) + (1 - done_b) * gamma_n * next_values[b, j]`.
pub fn quantile_targets(
    rewards: &Array2<f32>,
    dones: &Array1<bool>,
    next_values: &Array2<f32>,
    gamma_n: f32,
) -> Result<Array2<f32>> {
    let (bs, n_tau) = next_values.dim();
    if rewards.nrows() != bs || dones.len() != bs {
        return Err(TraderError::shape(format!(
            "batch of {} next quantiles with {} rewards and {} dones",
            bs,
            rewards.nrows(),
            dones.len()
        )));
    }
    let reward = rewards.sum_axis(Axis(1));
    Ok(Array2::from_shape_fn((bs, n_tau), |(b, j)| {
        let bootstrap = if dones[b] { 0.0 } else { gamma_n * next_values[[b, j]] };
        reward[b] + bootstrap
    }))
}

/// `H_k(u)`: quadratic inside `[-k, k]`, linear outside.
pub fn huber(u: f32, k: f32) -> f32 {
    if u.abs() <= k {
        0.5 * u * u
    } else {
        k * (u.abs() - 0.5 * k)
    }
}

/// Asymmetric quantile Huber term `|tau - 1{u < 0}| * H_k(u) / k`.
pub fn quantile_huber(u: f32, tau: f32, k: f32) -> f32 {
    let indicator = if u < 0.0 { 1.0 } else { 0.0 };
    (tau - indicator).abs() * huber(u, k) / k
}

/// Output of [`quantile_huber_loss`].
#[derive(Debug, Clone)]
pub struct QuantileLoss {
    pub loss: f32,
    /// Mean `|u|` over the fraction grid, one per sample
    pub td_error: Array1<f32>,
    /// `dL/dQt`, `[batch, n_tau1]`
    pub grad_qt: Array2<f32>,
}

/// Quantile Huber loss over the `n_tau1 x n_tau2` grid.
///
/// Per sample: `sum_k mean_j rho(Gt_j - Qt_k, tau_k)`, scaled by the
/// importance weight when given, then averaged over the batch.
pub fn quantile_huber_loss(
    qt: &Array2<f32>,
    gt: &Array2<f32>,
    taus: &Array2<f32>,
    k: f32,
    weights: Option<&Array1<f32>>,
) -> QuantileLoss {
    assert_eq!(qt.nrows(), gt.nrows(), "Qt and Gt batch sizes differ");
    assert_eq!(qt.shape(), taus.shape(), "Qt and tau shapes differ");
    let (bs, n1) = qt.dim();
    let n2 = gt.ncols();

    let mut loss = 0.0f32;
    let mut td_error = Array1::zeros(bs);
    let mut grad_qt = Array2::zeros((bs, n1));
    for b in 0..bs {
        let w = weights.map(|w| w[b]).unwrap_or(1.0);
        let mut sample_loss = 0.0f32;
        let mut abs_sum = 0.0f32;
        for i in 0..n1 {
            let tau = taus[[b, i]];
            let mut row_loss = 0.0f32;
            let mut row_grad = 0.0f32;
            for j in 0..n2 {
                let u = gt[[b, j]] - qt[[b, i]];
                let weight = (tau - if u < 0.0 { 1.0 } else { 0.0 }).abs();
                row_loss += weight * huber(u, k) / k;
                let dh = if u.abs() <= k { u } else { k * u.signum() };
                // du/dQt = -1
                row_grad -= weight * dh / k;
                abs_sum += u.abs();
            }
            sample_loss += row_loss / n2 as f32;
            grad_qt[[b, i]] = w * row_grad / (n2 as f32 * bs as f32);
        }
        loss += w * sample_loss;
        td_error[b] = abs_sum / (n1 * n2) as f32;
    }

    QuantileLoss {
        loss: loss / bs.max(1) as f32,
        td_error,
        grad_qt,
    }
}
