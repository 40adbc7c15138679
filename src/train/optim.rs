//! Adam with inspectable moment estimates.
//!
//! Same update as `torch.optim.Adam` without weight decay. Parameters are
//! tracked by name so the moments can be written next to the weights and
//! restored exactly.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

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
            eps: 1e-8,
        }
    }
}

#[derive(Debug)]
struct Slot {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Saved optimizer state: step count plus `(name, m, v)` per parameter.
#[derive(Debug, Clone)]
pub struct AdamState {
    pub t: u64,
    pub moments: Vec<(String, Tensor, Tensor)>,
}

#[derive(Debug)]
pub struct Adam {
    slots: Vec<Slot>,
    config: AdamConfig,
    t: u64,
}

impl Adam {
    /// Track every variable of `varmap`, ordered by name.
    pub fn from_varmap(varmap: &VarMap, config: AdamConfig) -> Result<Self> {
        let vars = named_vars(varmap)?;
        Self::from_named(vars, config)
    }

    fn from_named(vars: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots, config, t: 0 })
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.slots.iter().map(|s| &s.var)
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            t: self.t,
            moments: self
                .slots
                .iter()
                .map(|s| (s.name.clone(), s.m.clone(), s.v.clone()))
                .collect(),
        }
    }

    /// Restore moments saved by [`Adam::state`]. Every tracked parameter must
    /// be present with a matching shape.
    pub fn load_state(&mut self, state: AdamState) -> Result<()> {
        let mut moments: std::collections::HashMap<String, (Tensor, Tensor)> = state
            .moments
            .into_iter()
            .map(|(name, m, v)| (name, (m, v)))
            .collect();
        for slot in &mut self.slots {
            let (m, v) = moments.remove(&slot.name).ok_or_else(|| {
                Error::Checkpoint(format!("optimizer state missing for {}", slot.name))
            })?;
            if m.shape() != slot.var.shape() || v.shape() != slot.var.shape() {
                return Err(Error::Checkpoint(format!(
                    "optimizer state for {} has shape {:?}, expected {:?}",
                    slot.name,
                    m.shape(),
                    slot.var.shape()
                )));
            }
            let device = slot.var.device();
            slot.m = m.to_device(device)?.to_dtype(slot.var.dtype())?;
            slot.v = v.to_device(device)?.to_dtype(slot.var.dtype())?;
        }
        self.t = state.t;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::from_named(named, config).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    /// Parameters without a gradient (e.g. batch-norm running statistics)
    /// are left untouched.
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.t += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);

        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let m = ((&slot.m * beta1)? + (grad * (1.0 - beta1))?)?;
            let v = ((&slot.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            slot.var.set(&slot.var.sub(&(update * lr)?)?)?;
            slot.m = m;
            slot.v = v;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// `(name, var)` pairs of `varmap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("parameter store lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
