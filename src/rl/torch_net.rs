//! libtorch-backed Q network
//!
//! Same architecture and parameter names as [`MlpQNetwork`] (weights stored
//! `[in, out]`), so checkpoints move freely between the two backends.
//! Autograd replaces the hand-written backward pass and updates go through
//! tch's own Adam. Its moment estimates live on the device and are not part
//! of the JSON checkpoint.
//!
//! This module is only compiled when the "torch" feature is enabled.

use std::f64::consts::PI;

use ndarray::{Array2, Array4, ArrayD, IxDyn};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{Result, TraderError};

use super::data::StateBatch;
use super::network::{MlpQNetwork, NetworkSpec, ParamStore, QNetwork};
use super::optimizer::Adam;

struct NoisyHead {
    weight_sigma: Tensor,
    bias_sigma: Tensor,
    /// Factorised noise `f(eps_in) f(eps_out)^T` and `f(eps_out)`
    noise_w: Tensor,
    noise_b: Tensor,
}

pub struct TorchQNetwork {
    spec: NetworkSpec,
    vs: nn::VarStore,
    fc1_weight: Tensor,
    fc1_bias: Tensor,
    tau_embed: Option<(Tensor, Tensor)>,
    head_weight: Tensor,
    head_bias: Tensor,
    noisy: Option<NoisyHead>,
    training: bool,
    /// Output of the last `forward_train`, still attached to the graph
    cached: Option<Tensor>,
    /// Built on the first update with the configured learning rate
    optimizer: Option<nn::Optimizer>,
}

fn to_tensor(a: &Array2<f32>, device: Device) -> Tensor {
    let data: Vec<f32> = a.iter().copied().collect();
    Tensor::from_slice(&data)
        .reshape([a.nrows() as i64, a.ncols() as i64])
        .to_device(device)
}

fn from_array(a: &ArrayD<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = a.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = a.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape.as_slice()).to_device(device)
}

fn to_array(t: &Tensor) -> ArrayD<f32> {
    let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
    let t = t.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
    let numel = t.numel();
    let mut data = vec![0.0f32; numel];
    t.copy_data(&mut data, numel);
    ArrayD::from_shape_vec(IxDyn(&shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape)))
}

fn scale_noise(x: f32) -> f32 {
    x.signum() * x.abs().sqrt()
}

impl TorchQNetwork {
    /// Build on the best available device with the same initialisation as
    /// the reference network.
    pub fn new<R: rand::Rng + ?Sized>(spec: NetworkSpec, rng: &mut R) -> Result<Self> {
        let init = MlpQNetwork::new(spec.clone(), rng)?;
        let vs = nn::VarStore::new(Device::cuda_if_available());
        let root = vs.root();
        let in_dim = spec.input_dim() as i64;
        let out_dim = spec.output_dim() as i64;
        let d = spec.d_model as i64;
        let zero = nn::Init::Const(0.0);

        let fc1 = &root / "fc1";
        let fc1_weight = fc1.var("weight", &[in_dim, d], zero);
        let fc1_bias = fc1.var("bias", &[d], zero);
        let tau_embed = spec.n_cos.map(|n_cos| {
            let emb = &root / "tau_embed";
            (
                emb.var("weight", &[n_cos as i64, d], zero),
                emb.var("bias", &[d], zero),
            )
        });
        let head = &root / "head";
        let head_weight = head.var("weight", &[d, out_dim], zero);
        let head_bias = head.var("bias", &[out_dim], zero);
        let noisy = spec.noisy_sigma.map(|_| NoisyHead {
            weight_sigma: head.var("weight_sigma", &[d, out_dim], zero),
            bias_sigma: head.var("bias_sigma", &[out_dim], zero),
            noise_w: Tensor::zeros([d, out_dim], (Kind::Float, vs.device())),
            noise_b: Tensor::zeros([out_dim], (Kind::Float, vs.device())),
        });

        let mut net = Self {
            spec,
            vs,
            fc1_weight,
            fc1_bias,
            tau_embed,
            head_weight,
            head_bias,
            noisy,
            training: true,
            cached: None,
            optimizer: None,
        };
        net.load_state_dict(&init.state_dict())?;
        Ok(net)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    fn named(&self) -> Vec<(&'static str, &Tensor)> {
        let mut out = vec![("fc1.weight", &self.fc1_weight), ("fc1.bias", &self.fc1_bias)];
        if let Some((w, b)) = &self.tau_embed {
            out.push(("tau_embed.weight", w));
            out.push(("tau_embed.bias", b));
        }
        out.push(("head.weight", &self.head_weight));
        out.push(("head.bias", &self.head_bias));
        if let Some(noisy) = &self.noisy {
            out.push(("head.weight_sigma", &noisy.weight_sigma));
            out.push(("head.bias_sigma", &noisy.bias_sigma));
        }
        out
    }

    fn run(&self, states: &StateBatch, taus: Option<&Array2<f32>>) -> Result<Tensor> {
        let input = states.flatten();
        if input.ncols() != self.spec.input_dim() {
            return Err(TraderError::shape(format!(
                "network expects {} inputs per sample, got {}",
                self.spec.input_dim(),
                input.ncols()
            )));
        }
        let device = self.device();
        let bs = input.nrows() as i64;
        let d = self.spec.d_model as i64;

        let hidden = (to_tensor(&input, device).matmul(&self.fc1_weight) + &self.fc1_bias).relu();

        let (n_tau, features) = match (&self.tau_embed, taus) {
            (Some((w, b)), Some(taus)) => {
                if taus.nrows() as i64 != bs {
                    return Err(TraderError::shape(format!(
                        "{} rows of quantile fractions for a batch of {}",
                        taus.nrows(),
                        bs
                    )));
                }
                let n_tau = taus.ncols() as i64;
                let n_cos = w.size()[0];
                let t = to_tensor(taus, device).reshape([bs * n_tau, 1]);
                let i = Tensor::arange(n_cos, (Kind::Float, device)).unsqueeze(0);
                let basis = (t * i * PI).cos();
                let embed = (basis.matmul(w) + b).relu().reshape([bs, n_tau, d]);
                let mixed = embed * hidden.unsqueeze(1);
                (n_tau, mixed.reshape([bs * n_tau, d]))
            }
            (None, None) => (1, hidden),
            (Some(_), None) => {
                return Err(TraderError::shape("quantile network needs quantile fractions"))
            }
            (None, Some(_)) => {
                return Err(TraderError::shape(
                    "quantile fractions passed to a scalar network",
                ))
            }
        };

        let out = match (&self.noisy, self.training) {
            (Some(noisy), true) => {
                let w = &self.head_weight + &noisy.weight_sigma * &noisy.noise_w;
                let b = &self.head_bias + &noisy.bias_sigma * &noisy.noise_b;
                features.matmul(&w) + b
            }
            _ => features.matmul(&self.head_weight) + &self.head_bias,
        };
        Ok(out.reshape([
            bs,
            n_tau,
            self.spec.n_assets as i64,
            self.spec.action_atoms as i64,
        ]))
    }
}

fn into_array4(t: &Tensor) -> Result<Array4<f32>> {
    to_array(t)
        .into_dimensionality()
        .map_err(|e| TraderError::shape(e.to_string()))
}

impl QNetwork for TorchQNetwork {
    fn output_shape(&self) -> (usize, usize) {
        (self.spec.n_assets, self.spec.action_atoms)
    }

    fn is_quantile(&self) -> bool {
        self.tau_embed.is_some()
    }

    fn forward(&self, states: &StateBatch, taus: Option<&Array2<f32>>) -> Result<Array4<f32>> {
        let out = tch::no_grad(|| self.run(states, taus))?;
        into_array4(&out)
    }

    fn forward_train(
        &mut self,
        states: &StateBatch,
        taus: Option<&Array2<f32>>,
    ) -> Result<Array4<f32>> {
        let out = self.run(states, taus)?;
        let arr = into_array4(&out)?;
        self.cached = Some(out);
        Ok(arr)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<ParamStore> {
        let out = self
            .cached
            .take()
            .ok_or_else(|| TraderError::shape("backward called without forward_train"))?;
        let expected: Vec<i64> = grad_output.shape().iter().map(|&d| d as i64).collect();
        if out.size() != expected {
            return Err(TraderError::shape(format!(
                "gradient shape {:?} does not match output {:?}",
                expected,
                out.size()
            )));
        }

        for mut var in self.vs.trainable_variables() {
            var.zero_grad();
        }
        let data: Vec<f32> = grad_output.iter().copied().collect();
        let grad = Tensor::from_slice(&data).reshape(expected.as_slice()).to_device(self.device());
        (out * grad).sum(Kind::Float).backward();

        let mut grads = ParamStore::new();
        for (name, param) in self.named() {
            let g = param.grad();
            let value = if g.defined() {
                to_array(&g)
            } else {
                ArrayD::zeros(IxDyn(&param.size().iter().map(|&d| d as usize).collect::<Vec<_>>()))
            };
            grads.insert(name, value);
        }
        Ok(grads)
    }

    fn sample_noise(&mut self, rng: &mut dyn RngCore) {
        let d = self.spec.d_model;
        let out_dim = self.spec.output_dim();
        let device = self.device();
        if let Some(noisy) = self.noisy.as_mut() {
            let f_in: Vec<f32> = (0..d)
                .map(|_| scale_noise(StandardNormal.sample(&mut *rng)))
                .collect();
            let f_out: Vec<f32> = (0..out_dim)
                .map(|_| scale_noise(StandardNormal.sample(&mut *rng)))
                .collect();
            let f_in = Tensor::from_slice(&f_in).to_device(device);
            let f_out = Tensor::from_slice(&f_out).to_device(device);
            noisy.noise_w = f_in.unsqueeze(1).matmul(&f_out.unsqueeze(0));
            noisy.noise_b = f_out;
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn state_dict(&self) -> ParamStore {
        let mut params = ParamStore::new();
        for (name, tensor) in self.named() {
            params.insert(name, to_array(tensor));
        }
        params
    }

    fn load_state_dict(&mut self, params: &ParamStore) -> Result<()> {
        self.state_dict().check_compatible(params)?;
        let device = self.device();
        for (name, tensor) in self.named() {
            let src = params
                .get(name)
                .ok_or_else(|| TraderError::shape(format!("missing parameter {}", name)))?;
            let src = from_array(src, device);
            let mut dst = tensor.shallow_clone();
            tch::no_grad(|| {
                dst.copy_(&src);
            });
        }
        self.cached = None;
        Ok(())
    }

    /// Write the (clipped) gradients back onto the variables and step the
    /// tch optimizer. `optimizer` only supplies the learning rate and counts
    /// the step.
    fn apply_gradients(&mut self, grads: &ParamStore, optimizer: &mut Adam) -> Result<()> {
        self.state_dict().check_compatible(grads)?;
        if self.optimizer.is_none() {
            let opt = nn::Adam::default()
                .build(&self.vs, optimizer.learning_rate() as f64)
                .map_err(|e| TraderError::config(format!("failed to build tch optimizer: {}", e)))?;
            self.optimizer = Some(opt);
        }

        let device = self.device();
        for (name, param) in self.named() {
            let src = grads
                .get(name)
                .ok_or_else(|| TraderError::shape(format!("missing gradient for {}", name)))?;
            let mut grad = param.grad();
            if !grad.defined() {
                return Err(TraderError::shape(format!(
                    "no gradient recorded for {}, call backward first",
                    name
                )));
            }
            let src = from_array(src, device);
            tch::no_grad(|| {
                grad.copy_(&src);
            });
        }
        if let Some(opt) = self.optimizer.as_mut() {
            opt.step();
        }
        optimizer.record_step();
        Ok(())
    }
}
