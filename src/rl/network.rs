//! Q-Network Interface and Reference MLP
//!
//! The agent talks to its function approximator only through [`QNetwork`].
//! Outputs are always rank 4: `[batch, n_tau, assets, action_atoms]`, where
//! `n_tau` is 1 for scalar (DQN) networks and the number of quantile
//! fractions for distributional (IQN) networks.
//!
//! [`MlpQNetwork`] is a small dependency-free implementation used by tests
//! and CPU runs:
//! - `fc1`: flattened window + portfolio -> `d_model`, ReLU
//! - `tau_embed` (quantile mode): `relu(cos(pi * i * tau) W + b)` multiplied
//!   into the hidden state per fraction
//! - `head`: `d_model -> assets * atoms`, optionally a factorised Gaussian
//!   noisy layer

use std::collections::BTreeMap;
use std::f32::consts::PI;

use ndarray::{Array1, Array2, Array3, Array4, ArrayD, Axis, Zip};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::{AgentVariant, ExperimentConfig, InputShape};
use crate::error::{Result, TraderError};

use super::data::StateBatch;
use super::optimizer::Adam;

// =============================================================================
// Parameter store
// =============================================================================

/// Named parameter tensors (state dict). Also used for gradients and
/// optimizer moments so every tensor lines up by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStore {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
        self.tensors.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ArrayD<f32>)> {
        self.tensors.iter_mut()
    }

    /// Same names and shapes, all zeros.
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(k, v)| (k.clone(), ArrayD::zeros(v.raw_dim())))
                .collect(),
        }
    }

    /// Total number of scalars
    pub fn numel(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Name -> shape listing for diagnostics.
    pub fn shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.tensors
            .iter()
            .map(|(k, v)| (k.clone(), v.shape().to_vec()))
            .collect()
    }

    /// L2 norm over every tensor.
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .values()
            .map(|t| t.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for t in self.tensors.values_mut() {
            t.mapv_inplace(|x| x * factor);
        }
    }

    /// Error unless `other` has exactly the same names and shapes.
    pub fn check_compatible(&self, other: &ParamStore) -> Result<()> {
        if self.tensors.len() != other.tensors.len() {
            return Err(TraderError::shape(format!(
                "parameter count mismatch: {} vs {}",
                self.tensors.len(),
                other.tensors.len()
            )));
        }
        for (name, t) in &self.tensors {
            match other.tensors.get(name) {
                Some(o) if o.shape() == t.shape() => {}
                Some(o) => {
                    return Err(TraderError::shape(format!(
                        "parameter '{}' has shape {:?}, expected {:?}",
                        name,
                        o.shape(),
                        t.shape()
                    )))
                }
                None => {
                    return Err(TraderError::shape(format!("missing parameter '{}'", name)))
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Network interface
// =============================================================================

/// Function approximator used by the off-policy agents.
pub trait QNetwork {
    /// `(assets, action_atoms)` of the trailing output dimensions.
    fn output_shape(&self) -> (usize, usize);

    /// Whether the network expects quantile fractions.
    fn is_quantile(&self) -> bool;

    /// Inference forward pass. `taus` is `[batch, n_tau]` for quantile
    /// networks and must be `None` otherwise.
    fn forward(&self, states: &StateBatch, taus: Option<&Array2<f32>>) -> Result<Array4<f32>>;

    /// Forward pass that caches activations for a following `backward`.
    fn forward_train(
        &mut self,
        states: &StateBatch,
        taus: Option<&Array2<f32>>,
    ) -> Result<Array4<f32>>;

    /// Gradients of `sum(output * grad_output)` w.r.t. every parameter,
    /// using the activations cached by the last `forward_train`.
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<ParamStore>;

    /// Resample exploration noise. No-op for deterministic networks.
    fn sample_noise(&mut self, _rng: &mut dyn RngCore) {}

    /// Training mode enables noise; evaluation mode uses mean weights.
    fn set_training(&mut self, training: bool);

    fn state_dict(&self) -> ParamStore;

    fn load_state_dict(&mut self, params: &ParamStore) -> Result<()>;

    /// Apply one optimizer step with the given gradients.
    fn apply_gradients(&mut self, grads: &ParamStore, optimizer: &mut Adam) -> Result<()> {
        let mut params = self.state_dict();
        optimizer.step(&mut params, grads)?;
        self.load_state_dict(&params)
    }
}

/// `tau == 0` and `tau == 1` are kept; anything else is folded onto the
/// smaller of `tau` and `1 - tau`.
pub fn canonical_tau(tau: f64) -> f64 {
    if tau == 0.0 || tau == 1.0 {
        tau
    } else {
        tau.min(1.0 - tau)
    }
}

/// `target <- tau * behaviour + (1 - tau) * target`
pub fn soft_update<N: QNetwork + ?Sized>(target: &mut N, behaviour: &N, tau: f64) -> Result<()> {
    let src = behaviour.state_dict();
    let mut dst = target.state_dict();
    dst.check_compatible(&src)?;
    let tau = tau as f32;
    for (name, t) in dst.iter_mut() {
        if let Some(b) = src.get(name) {
            Zip::from(t).and(b).for_each(|t, &b| *t = tau * b + (1.0 - tau) * *t);
        }
    }
    target.load_state_dict(&dst)
}

pub fn hard_update<N: QNetwork + ?Sized>(target: &mut N, behaviour: &N) -> Result<()> {
    target.load_state_dict(&behaviour.state_dict())
}

// =============================================================================
// Reference MLP
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub input_shape: InputShape,
    pub n_assets: usize,
    pub action_atoms: usize,
    pub d_model: usize,
    /// Cosine basis size; `Some` builds a quantile network
    pub n_cos: Option<usize>,
    /// Initial noise scale; `Some` makes the head a noisy layer
    pub noisy_sigma: Option<f32>,
}

impl NetworkSpec {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            input_shape: config.input_shape,
            n_assets: config.n_assets,
            action_atoms: config.action_atoms,
            d_model: config.model.d_model,
            n_cos: match config.agent {
                AgentVariant::Iqn(_) => Some(config.model.n_cos),
                AgentVariant::Dqn => None,
            },
            noisy_sigma: if config.off_policy.noisy_net {
                Some(config.off_policy.noisy_net_sigma)
            } else {
                None
            },
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_shape.window * self.input_shape.features * self.n_assets + self.n_assets + 1
    }

    pub fn output_dim(&self) -> usize {
        self.n_assets * self.action_atoms
    }
}

#[derive(Debug, Clone)]
struct NoisyHead {
    weight_sigma: Array2<f32>,
    bias_sigma: Array1<f32>,
    eps_in: Array1<f32>,
    eps_out: Array1<f32>,
}

#[derive(Debug, Clone)]
struct TauEmbedding {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// Activations kept between `forward_train` and `backward`.
#[derive(Debug, Clone)]
struct ForwardCache {
    input: Array2<f32>,
    hidden_pre: Array2<f32>,
    hidden: Array2<f32>,
    /// `[batch * n_tau, n_cos]`
    tau_basis: Option<Array2<f32>>,
    embed_pre: Option<Array2<f32>>,
    embed: Option<Array2<f32>>,
    /// `[batch * n_tau, d_model]`
    features: Array2<f32>,
    head_weight: Array2<f32>,
    /// Noise factors applied to the head (zero when noise is off)
    noise_w: Option<Array2<f32>>,
    noise_b: Option<Array1<f32>>,
    output_shape: [usize; 4],
}

#[derive(Debug, Clone)]
pub struct MlpQNetwork {
    spec: NetworkSpec,
    fc1_weight: Array2<f32>,
    fc1_bias: Array1<f32>,
    tau_embed: Option<TauEmbedding>,
    head_weight: Array2<f32>,
    head_bias: Array1<f32>,
    noisy: Option<NoisyHead>,
    training: bool,
    cache: Option<ForwardCache>,
}

fn uniform_init<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let bound = 1.0 / (rows as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}

/// `sign(x) * sqrt(|x|)`
fn scale_noise(x: f32) -> f32 {
    x.signum() * x.abs().sqrt()
}

impl MlpQNetwork {
    pub fn new<R: Rng + ?Sized>(spec: NetworkSpec, rng: &mut R) -> Result<Self> {
        let in_dim = spec.input_dim();
        let out_dim = spec.output_dim();
        let d = spec.d_model;
        if d == 0 || out_dim == 0 {
            return Err(TraderError::config("network dimensions must be positive"));
        }

        let tau_embed = match spec.n_cos {
            Some(0) => return Err(TraderError::config("n_cos must be positive")),
            Some(n_cos) => Some(TauEmbedding {
                weight: uniform_init(n_cos, d, rng),
                bias: Array1::zeros(d),
            }),
            None => None,
        };
        let noisy = spec.noisy_sigma.map(|sigma0| {
            let init = sigma0 / (d as f32).sqrt();
            NoisyHead {
                weight_sigma: Array2::from_elem((d, out_dim), init),
                bias_sigma: Array1::from_elem(out_dim, init),
                eps_in: Array1::zeros(d),
                eps_out: Array1::zeros(out_dim),
            }
        });

        Ok(Self {
            fc1_weight: uniform_init(in_dim, d, rng),
            fc1_bias: Array1::zeros(d),
            tau_embed,
            head_weight: uniform_init(d, out_dim, rng),
            head_bias: Array1::zeros(out_dim),
            noisy,
            training: true,
            cache: None,
            spec,
        })
    }

    pub fn from_config<R: Rng + ?Sized>(config: &ExperimentConfig, rng: &mut R) -> Result<Self> {
        Self::new(NetworkSpec::from_config(config), rng)
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// Noise factors for the head in the current mode.
    fn head_noise(&self) -> Option<(Array2<f32>, Array1<f32>)> {
        let noisy = self.noisy.as_ref()?;
        if !self.training {
            return None;
        }
        let f_in = noisy.eps_in.mapv(scale_noise);
        let f_out = noisy.eps_out.mapv(scale_noise);
        let outer = f_in
            .view()
            .insert_axis(Axis(1))
            .dot(&f_out.view().insert_axis(Axis(0)));
        Some((outer, f_out))
    }

    fn run(
        &self,
        states: &StateBatch,
        taus: Option<&Array2<f32>>,
    ) -> Result<(ForwardCache, Array4<f32>)> {
        let input = states.flatten();
        let bs = input.nrows();
        if input.ncols() != self.spec.input_dim() {
            return Err(TraderError::shape(format!(
                "network expects {} inputs per sample, got {}",
                self.spec.input_dim(),
                input.ncols()
            )));
        }

        let hidden_pre = input.dot(&self.fc1_weight) + &self.fc1_bias;
        let hidden = hidden_pre.mapv(|x| x.max(0.0));
        let d = self.spec.d_model;

        let (n_tau, tau_basis, embed_pre, embed, features) = match (&self.tau_embed, taus) {
            (Some(emb), Some(taus)) => {
                if taus.nrows() != bs {
                    return Err(TraderError::shape(format!(
                        "{} rows of quantile fractions for a batch of {}",
                        taus.nrows(),
                        bs
                    )));
                }
                let n_tau = taus.ncols();
                let n_cos = emb.weight.nrows();
                let basis = Array2::from_shape_fn((bs * n_tau, n_cos), |(r, i)| {
                    (PI * i as f32 * taus[[r / n_tau, r % n_tau]]).cos()
                });
                let embed_pre = basis.dot(&emb.weight) + &emb.bias;
                let embed = embed_pre.mapv(|x| x.max(0.0));
                let embed3 = embed
                    .view()
                    .into_shape((bs, n_tau, d))
                    .map_err(|e| TraderError::shape(e.to_string()))?;
                let mixed: Array3<f32> = &embed3 * &hidden.view().insert_axis(Axis(1));
                let features = mixed
                    .into_shape((bs * n_tau, d))
                    .map_err(|e| TraderError::shape(e.to_string()))?;
                (n_tau, Some(basis), Some(embed_pre), Some(embed), features)
            }
            (None, None) => (1, None, None, None, hidden.clone()),
            (Some(_), None) => {
                return Err(TraderError::shape("quantile network needs quantile fractions"))
            }
            (None, Some(_)) => {
                return Err(TraderError::shape(
                    "quantile fractions passed to a scalar network",
                ))
            }
        };

        let noise = self.head_noise();
        let (head_weight, head_bias) = match (&noise, &self.noisy) {
            (Some((nw, nb)), Some(noisy)) => (
                &self.head_weight + &(&noisy.weight_sigma * nw),
                &self.head_bias + &(&noisy.bias_sigma * nb),
            ),
            _ => (self.head_weight.clone(), self.head_bias.clone()),
        };

        let (noise_w, noise_b) = match noise {
            Some((w, b)) => (Some(w), Some(b)),
            None => (None, None),
        };

        let out = features.dot(&head_weight) + &head_bias;
        let output_shape = [bs, n_tau, self.spec.n_assets, self.spec.action_atoms];
        let output = out
            .into_shape((bs, n_tau, self.spec.n_assets, self.spec.action_atoms))
            .map_err(|e| TraderError::shape(e.to_string()))?;

        let cache = ForwardCache {
            input,
            hidden_pre,
            hidden,
            tau_basis,
            embed_pre,
            embed,
            features,
            head_weight,
            noise_w,
            noise_b,
            output_shape,
        };
        Ok((cache, output))
    }
}

/// Zero `grad` wherever the pre-activation was not positive.
fn relu_backward(grad: &mut Array2<f32>, pre: &Array2<f32>) {
    Zip::from(grad).and(pre).for_each(|g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
}

fn take_matrix(params: &ParamStore, name: &str, shape: (usize, usize)) -> Result<Array2<f32>> {
    let t = params
        .get(name)
        .ok_or_else(|| TraderError::shape(format!("missing parameter '{}'", name)))?;
    if t.shape() != [shape.0, shape.1] {
        return Err(TraderError::shape(format!(
            "parameter '{}' has shape {:?}, expected {:?}",
            name,
            t.shape(),
            [shape.0, shape.1]
        )));
    }
    t.as_standard_layout()
        .into_owned()
        .into_dimensionality()
        .map_err(|e| TraderError::shape(e.to_string()))
}

fn take_vector(params: &ParamStore, name: &str, len: usize) -> Result<Array1<f32>> {
    let t = params
        .get(name)
        .ok_or_else(|| TraderError::shape(format!("missing parameter '{}'", name)))?;
    if t.shape() != [len] {
        return Err(TraderError::shape(format!(
            "parameter '{}' has shape {:?}, expected [{}]",
            name,
            t.shape(),
            len
        )));
    }
    t.as_standard_layout()
        .into_owned()
        .into_dimensionality()
        .map_err(|e| TraderError::shape(e.to_string()))
}

impl QNetwork for MlpQNetwork {
    fn output_shape(&self) -> (usize, usize) {
        (self.spec.n_assets, self.spec.action_atoms)
    }

    fn is_quantile(&self) -> bool {
        self.tau_embed.is_some()
    }

    fn forward(&self, states: &StateBatch, taus: Option<&Array2<f32>>) -> Result<Array4<f32>> {
        self.run(states, taus).map(|(_, output)| output)
    }

    fn forward_train(
        &mut self,
        states: &StateBatch,
        taus: Option<&Array2<f32>>,
    ) -> Result<Array4<f32>> {
        let (cache, output) = self.run(states, taus)?;
        self.cache = Some(cache);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<ParamStore> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| TraderError::shape("backward called without a cached forward pass"))?;
        if grad_output.shape() != cache.output_shape {
            return Err(TraderError::shape(format!(
                "gradient shape {:?} does not match output shape {:?}",
                grad_output.shape(),
                cache.output_shape
            )));
        }
        let [bs, n_tau, _, _] = cache.output_shape;
        let d = self.spec.d_model;
        let out_dim = self.spec.output_dim();
        let g = grad_output
            .as_standard_layout()
            .into_owned()
            .into_shape((bs * n_tau, out_dim))
            .map_err(|e| TraderError::shape(e.to_string()))?;

        let mut grads = ParamStore::new();

        // head
        let d_head_w = cache.features.t().dot(&g);
        let d_head_b = g.sum_axis(Axis(0));
        if let Some(noisy) = &self.noisy {
            let (sigma_w, sigma_b) = match (&cache.noise_w, &cache.noise_b) {
                (Some(nw), Some(nb)) => (&d_head_w * nw, &d_head_b * nb),
                _ => (
                    Array2::zeros(noisy.weight_sigma.raw_dim()),
                    Array1::zeros(noisy.bias_sigma.raw_dim()),
                ),
            };
            grads.insert("head.weight_sigma", sigma_w.into_dyn());
            grads.insert("head.bias_sigma", sigma_b.into_dyn());
        }
        let d_features = g.dot(&cache.head_weight.t());
        grads.insert("head.weight", d_head_w.into_dyn());
        grads.insert("head.bias", d_head_b.into_dyn());

        // quantile embedding
        let mut d_hidden = match (&self.tau_embed, &cache.embed, &cache.embed_pre, &cache.tau_basis)
        {
            (Some(_), Some(embed), Some(embed_pre), Some(basis)) => {
                let shape3 = (bs, n_tau, d);
                let d_feat3 = d_features
                    .into_shape(shape3)
                    .map_err(|e| TraderError::shape(e.to_string()))?;
                let embed3 = embed
                    .view()
                    .into_shape(shape3)
                    .map_err(|e| TraderError::shape(e.to_string()))?;
                let d_hidden = (&d_feat3 * &embed3).sum_axis(Axis(1));
                let d_embed3: Array3<f32> = &d_feat3 * &cache.hidden.view().insert_axis(Axis(1));
                let mut d_embed = d_embed3
                    .into_shape((bs * n_tau, d))
                    .map_err(|e| TraderError::shape(e.to_string()))?;
                relu_backward(&mut d_embed, embed_pre);
                grads.insert("tau_embed.weight", basis.t().dot(&d_embed).into_dyn());
                grads.insert("tau_embed.bias", d_embed.sum_axis(Axis(0)).into_dyn());
                d_hidden
            }
            _ => d_features,
        };

        // fc1
        relu_backward(&mut d_hidden, &cache.hidden_pre);
        grads.insert("fc1.weight", cache.input.t().dot(&d_hidden).into_dyn());
        grads.insert("fc1.bias", d_hidden.sum_axis(Axis(0)).into_dyn());

        Ok(grads)
    }

    fn sample_noise(&mut self, rng: &mut dyn RngCore) {
        if let Some(noisy) = self.noisy.as_mut() {
            noisy.eps_in.mapv_inplace(|_| rng.sample(StandardNormal));
            noisy.eps_out.mapv_inplace(|_| rng.sample(StandardNormal));
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn state_dict(&self) -> ParamStore {
        let mut params = ParamStore::new();
        params.insert("fc1.weight", self.fc1_weight.clone().into_dyn());
        params.insert("fc1.bias", self.fc1_bias.clone().into_dyn());
        if let Some(emb) = &self.tau_embed {
            params.insert("tau_embed.weight", emb.weight.clone().into_dyn());
            params.insert("tau_embed.bias", emb.bias.clone().into_dyn());
        }
        params.insert("head.weight", self.head_weight.clone().into_dyn());
        params.insert("head.bias", self.head_bias.clone().into_dyn());
        if let Some(noisy) = &self.noisy {
            params.insert("head.weight_sigma", noisy.weight_sigma.clone().into_dyn());
            params.insert("head.bias_sigma", noisy.bias_sigma.clone().into_dyn());
        }
        params
    }

    fn load_state_dict(&mut self, params: &ParamStore) -> Result<()> {
        self.state_dict().check_compatible(params)?;
        let d = self.spec.d_model;
        let out_dim = self.spec.output_dim();
        self.fc1_weight = take_matrix(params, "fc1.weight", (self.spec.input_dim(), d))?;
        self.fc1_bias = take_vector(params, "fc1.bias", d)?;
        if let Some(emb) = self.tau_embed.as_mut() {
            emb.weight = take_matrix(params, "tau_embed.weight", (emb.weight.nrows(), d))?;
            emb.bias = take_vector(params, "tau_embed.bias", d)?;
        }
        self.head_weight = take_matrix(params, "head.weight", (d, out_dim))?;
        self.head_bias = take_vector(params, "head.bias", out_dim)?;
        if let Some(noisy) = self.noisy.as_mut() {
            noisy.weight_sigma = take_matrix(params, "head.weight_sigma", (d, out_dim))?;
            noisy.bias_sigma = take_vector(params, "head.bias_sigma", out_dim)?;
        }
        self.cache = None;
        Ok(())
    }
}
