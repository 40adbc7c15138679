//! Parameters, optimizer state and step counter, updated together.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use super::optim::{Adam, AdamConfig};
use crate::Result;

/// Outcome of one [`TrainableUnit::apply_gradients`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Global gradient L2 norm before clipping.
    pub grad_norm: f64,
    /// `false` when the norm was not finite and the update was skipped.
    pub applied: bool,
    /// Step counter after this call.
    pub step: u64,
}

/// Model parameters plus Adam state plus the global step counter.
///
/// Parameters change only through [`TrainableUnit::apply_gradients`].
pub struct TrainableUnit {
    varmap: VarMap,
    optimizer: Adam,
    step: u64,
}

impl TrainableUnit {
    /// Wrap an already-populated `varmap` (build the model first).
    pub fn new(varmap: VarMap, lr: f64) -> Result<Self> {
        let optimizer = Adam::from_varmap(
            &varmap,
            AdamConfig {
                lr,
                ..Default::default()
            },
        )?;
        Ok(Self {
            varmap,
            optimizer,
            step: 0,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub(crate) fn optimizer_mut(&mut self) -> &mut Adam {
        &mut self.optimizer
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub(crate) fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Back-propagate `loss`, clip to `clip_norm`, update, and advance the
    /// step counter.
    ///
    /// A non-finite gradient norm is logged and the update skipped; the
    /// step counter still advances so schedule and checkpoint cadence hold.
    pub fn apply_gradients(&mut self, loss: &Tensor, clip_norm: Option<f64>) -> Result<StepReport> {
        let mut grads = loss.backward()?;
        let vars: Vec<Var> = self.optimizer.vars().cloned().collect();

        let grad_norm = match clip_norm {
            Some(max_norm) => clip_grad_norm(&mut grads, &vars, max_norm)?,
            None => global_grad_norm(&grads, &vars)?,
        };

        let applied = grad_norm.is_finite();
        if applied {
            self.optimizer.step(&grads)?;
        } else {
            tracing::warn!(
                step = self.step,
                grad_norm,
                "non-finite gradient norm, skipping update"
            );
        }
        self.step += 1;

        Ok(StepReport {
            grad_norm,
            applied,
            step: self.step,
        })
    }
}

/// L2 norm over every gradient of `vars`.
pub fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .sqr()?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
            total += sq;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`.
/// Returns the norm before clipping. Non-finite norms are left untouched.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = global_grad_norm(grads, vars)?;
    if !norm.is_finite() {
        return Ok(norm);
    }
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * coef)?);
            }
        }
    }
    Ok(norm)
}
