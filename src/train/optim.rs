//! Adam with named, checkpointable moments.
//!
//! Implements [`candle_nn::Optimizer`] and adds what training needs on top:
//! global-norm gradient clipping, a non-finite gradient check, exponential
//! learning-rate decay, and export/import of the moment buffers.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use crate::config::TrainConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
        }
    }
}

impl From<&TrainConfig> for AdamConfig {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            lr: cfg.initial_learning_rate,
            beta1: cfg.adam_beta1,
            beta2: cfg.adam_beta2,
            eps: cfg.adam_epsilon,
        }
    }
}

#[derive(Debug)]
struct ParamState {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

#[derive(Debug)]
pub struct Adam {
    params: Vec<ParamState>,
    config: AdamConfig,
    /// Number of updates applied so far (bias correction).
    step: usize,
}

/// Squared-norm summary of one gradient set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradNorm {
    pub norm: f64,
    pub finite: bool,
}

impl Adam {
    /// One parameter slot per var, sorted by name.
    pub fn named(mut vars: Vec<(String, Var)>, config: AdamConfig) -> candle_core::Result<Self> {
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        let params = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let m = Var::zeros(var.dims(), var.dtype(), var.device())?;
                let v = Var::zeros(var.dims(), var.dtype(), var.device())?;
                Ok(ParamState { name, var, m, v })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            params,
            config,
            step: 0,
        })
    }

    /// Optimize every variable of `varmap`.
    pub fn from_varmap(varmap: &VarMap, config: AdamConfig) -> Result<Self> {
        let vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        Ok(Self::named(vars, config)?)
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn set_step_count(&mut self, step: usize) {
        self.step = step;
    }

    /// Global L2 norm over all gradients present in `grads`.
    pub fn grad_norm(&self, grads: &GradStore) -> Result<GradNorm> {
        let mut total = 0f64;
        for p in &self.params {
            if let Some(g) = grads.get(p.var.as_tensor()) {
                total += g
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64;
            }
        }
        Ok(GradNorm {
            norm: total.sqrt(),
            finite: total.is_finite(),
        })
    }

    /// Apply one update with every gradient multiplied by `scale`.
    pub fn step_scaled(&mut self, grads: &GradStore, scale: f64) -> candle_core::Result<()> {
        self.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let t = self.step as i32;
        let m_correction = 1.0 / (1.0 - beta1.powi(t));
        let v_correction = 1.0 / (1.0 - beta2.powi(t));

        for p in &self.params {
            let Some(g) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let g = (g * scale)?;
            let next_m = ((p.m.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
            let next_v = ((p.v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * m_correction)?;
            let v_hat = (&next_v * v_correction)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (p.var.as_tensor() - (update * lr)?)?;
            p.m.set(&next_m)?;
            p.v.set(&next_v)?;
            p.var.set(&next_theta)?;
        }
        Ok(())
    }

    /// First and second moments keyed `adam.m.<name>` / `adam.v.<name>`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(self.params.len() * 2);
        for p in &self.params {
            out.insert(format!("adam.m.{}", p.name), p.m.as_tensor().clone());
            out.insert(format!("adam.v.{}", p.name), p.v.as_tensor().clone());
        }
        out
    }

    /// Restore moments saved by [`Adam::state_tensors`].
    ///
    /// Every parameter must have both moments with a matching shape.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        for p in &self.params {
            for (kind, slot) in [("m", &p.m), ("v", &p.v)] {
                let key = format!("adam.{kind}.{}", p.name);
                let saved = tensors
                    .get(&key)
                    .ok_or_else(|| Error::Checkpoint(format!("missing optimizer state '{key}'")))?;
                if saved.shape() != slot.shape() {
                    return Err(Error::Checkpoint(format!(
                        "optimizer state '{key}' has shape {:?}, expected {:?}",
                        saved.dims(),
                        slot.dims()
                    )));
                }
                slot.set(&saved.to_dtype(slot.dtype())?.to_device(slot.device())?)?;
            }
        }
        self.step = step;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("param.{i:05}"), v))
            .collect();
        Self::named(named, config)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_scaled(grads, 1.0)
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Exponentially decayed learning rate, held at the initial value until
/// `start_decay` and clamped to `[final_learning_rate, initial_learning_rate]`.
pub fn learning_rate_at(step: usize, cfg: &TrainConfig) -> f64 {
    let init = cfg.initial_learning_rate;
    if step <= cfg.start_decay {
        return init;
    }
    let progress = (step - cfg.start_decay) as f64 / cfg.decay_steps as f64;
    let lr = init * cfg.decay_rate.powf(progress);
    lr.clamp(cfg.final_learning_rate.min(init), init)
}

/// Gradient multiplier that brings `norm` down to `max_norm`.
pub fn clip_scale(norm: f64, max_norm: Option<f64>) -> f64 {
    match max_norm {
        Some(max) if norm > max && norm > 0.0 => max / norm,
        _ => 1.0,
    }
}
