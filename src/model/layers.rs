//! Building blocks shared by the encoder, decoder and postnet.
//!
//! - [`PreNet`] — two Linear+ReLU+dropout bottleneck layers
//! - [`BatchNormConv`] — Conv1d (no bias) → optional ReLU → BatchNorm
//! - [`Highway`] — gated highway layer
//! - [`GruCell`] / [`LstmCell`] — single-step recurrent cells (PyTorch gate order)
//! - [`BiGru`] — bidirectional GRU over a padded batch

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Linear, VarBuilder, ops};

// ---------------------------------------------------------------------------
// PreNet
// ---------------------------------------------------------------------------

/// `Linear → ReLU → dropout → Linear → ReLU → dropout`.
///
/// Dropout is driven by an explicit flag rather than train/eval mode: the
/// decoder pre-net keeps it on at inference unless the caller disables it.
#[derive(Debug, Clone)]
pub struct PreNet {
    fc1: Linear,
    fc2: Linear,
    dropout: f32,
}

impl PreNet {
    pub fn new(
        in_dims: usize,
        fc1_dims: usize,
        fc2_dims: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(in_dims, fc1_dims, vb.pp("fc1"))?,
            fc2: candle_nn::linear(fc1_dims, fc2_dims, vb.pp("fc2"))?,
            dropout,
        })
    }

    /// `x`: `[..., in_dims]` → `[..., fc2_dims]`
    pub fn forward(&self, x: &Tensor, dropout: bool) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.relu()?;
        let x = self.maybe_dropout(x, dropout)?;
        let x = self.fc2.forward(&x)?.relu()?;
        self.maybe_dropout(x, dropout)
    }

    fn maybe_dropout(&self, x: Tensor, dropout: bool) -> Result<Tensor> {
        if dropout && self.dropout > 0.0 {
            ops::dropout(&x, self.dropout)
        } else {
            Ok(x)
        }
    }
}

// ---------------------------------------------------------------------------
// BatchNormConv
// ---------------------------------------------------------------------------

/// Same-length 1-D convolution followed by batch normalization.
#[derive(Debug, Clone)]
pub struct BatchNormConv {
    conv: Conv1d,
    kernel: usize,
    bnorm: BatchNorm,
    relu: bool,
}

impl BatchNormConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig::default();
        Ok(Self {
            conv: candle_nn::conv1d_no_bias(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?,
            kernel,
            bnorm: candle_nn::batch_norm(out_channels, 1e-5, vb.pp("bnorm"))?,
            relu,
        })
    }

    /// `x`: `[B, C_in, T]` → `[B, C_out, T]`
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let y = self.conv.forward(&same_padding(x, self.kernel)?)?;
        let y = if self.relu { y.relu()? } else { y };
        y.apply_t(&self.bnorm, train)
    }
}

/// Zero-pad the time axis (dim 2) so a `kernel`-wide convolution without
/// padding keeps the input length. Even kernels get the extra frame on the left.
///
/// Padding is applied outside the convolution: candle's conv1d backward pass
/// underflows when the built-in padding exceeds the input length.
pub(crate) fn same_padding(x: &Tensor, kernel: usize) -> Result<Tensor> {
    x.pad_with_zeros(2, kernel / 2, kernel.saturating_sub(1) / 2)
}

// ---------------------------------------------------------------------------
// Highway
// ---------------------------------------------------------------------------

/// `y = g·relu(W1 x) + (1 - g)·x` with `g = σ(W2 x)`.
#[derive(Debug, Clone)]
pub struct Highway {
    w1: Linear,
    w2: Linear,
}

impl Highway {
    pub fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w1: candle_nn::linear(size, size, vb.pp("w1"))?,
            w2: candle_nn::linear(size, size, vb.pp("w2"))?,
        })
    }
}

impl Module for Highway {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.w1.forward(x)?.relu()?;
        let g = ops::sigmoid(&self.w2.forward(x)?)?;
        // g·h + (1 - g)·x == x + g·(h - x)
        x + g.mul(&(h - x)?)?
    }
}

// ---------------------------------------------------------------------------
// Recurrent cells
// ---------------------------------------------------------------------------

/// Single-step GRU cell, gates ordered `(r, z, n)`.
#[derive(Debug, Clone)]
pub struct GruCell {
    ih: Linear,
    hh: Linear,
    hidden: usize,
}

impl GruCell {
    pub fn new(input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ih: candle_nn::linear(input, 3 * hidden, vb.pp("ih"))?,
            hh: candle_nn::linear(hidden, 3 * hidden, vb.pp("hh"))?,
            hidden,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// `x`: `[B, input]`, `h`: `[B, hidden]` → next `h`.
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gi = self.ih.forward(x)?.chunk(3, D::Minus1)?;
        let gh = self.hh.forward(h)?.chunk(3, D::Minus1)?;
        let r = ops::sigmoid(&(&gi[0] + &gh[0])?)?;
        let z = ops::sigmoid(&(&gi[1] + &gh[1])?)?;
        let n = (&gi[2] + r.mul(&gh[2])?)?.tanh()?;
        // (1 - z)·n + z·h == n + z·(h - n)
        &n + z.mul(&(h - &n)?)?
    }
}

/// Single-step LSTM cell, gates ordered `(i, f, g, o)`.
#[derive(Debug, Clone)]
pub struct LstmCell {
    ih: Linear,
    hh: Linear,
}

impl LstmCell {
    pub fn new(input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ih: candle_nn::linear(input, 4 * hidden, vb.pp("ih"))?,
            hh: candle_nn::linear(hidden, 4 * hidden, vb.pp("hh"))?,
        })
    }

    /// Returns `(h, c)`.
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (self.ih.forward(x)? + self.hh.forward(h)?)?;
        let gates = gates.chunk(4, D::Minus1)?;
        let i = ops::sigmoid(&gates[0])?;
        let f = ops::sigmoid(&gates[1])?;
        let g = gates[2].tanh()?;
        let o = ops::sigmoid(&gates[3])?;
        let c = (f.mul(c)? + i.mul(&g)?)?;
        let h = o.mul(&c.tanh()?)?;
        Ok((h, c))
    }
}

/// Zoneout: in training each unit keeps its previous value with probability
/// `p`; otherwise the new value passes through unchanged.
pub fn zoneout(prev: &Tensor, next: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(next.clone());
    }
    let keep = Tensor::rand(0f32, 1f32, prev.shape(), prev.device())?
        .lt(p)?
        .to_dtype(prev.dtype())?;
    next + keep.mul(&(prev - next)?)?
}

// ---------------------------------------------------------------------------
// Bidirectional GRU
// ---------------------------------------------------------------------------

/// Bidirectional GRU over `[B, T, C]`, outputs `[B, T, 2·hidden]`.
///
/// With a `[B, T]` validity mask, the state only advances on valid positions,
/// so the backward pass of each sequence starts at its true last element.
#[derive(Debug, Clone)]
pub struct BiGru {
    fwd: GruCell,
    bwd: GruCell,
}

impl BiGru {
    pub fn new(input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fwd: GruCell::new(input, hidden, vb.pp("forward"))?,
            bwd: GruCell::new(input, hidden, vb.pp("backward"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (_, len, _) = x.dims3()?;
        let fwd = self.run(&self.fwd, x, mask, 0..len)?;
        let mut bwd = self.run(&self.bwd, x, mask, (0..len).rev())?;
        bwd.reverse();
        let fwd = Tensor::stack(&fwd, 1)?;
        let bwd = Tensor::stack(&bwd, 1)?;
        Tensor::cat(&[&fwd, &bwd], 2)
    }

    fn run(
        &self,
        cell: &GruCell,
        x: &Tensor,
        mask: Option<&Tensor>,
        order: impl Iterator<Item = usize>,
    ) -> Result<Vec<Tensor>> {
        let batch = x.dim(0)?;
        let mut h = Tensor::zeros((batch, cell.hidden_size()), x.dtype(), x.device())?;
        let mut outputs = Vec::with_capacity(x.dim(1)?);
        for t in order {
            let xt = x.narrow(1, t, 1)?.squeeze(1)?;
            let next = cell.step(&xt, &h)?;
            h = match mask {
                Some(mask) => {
                    let m = mask.narrow(1, t, 1)?;
                    (&h + next.sub(&h)?.broadcast_mul(&m)?)?
                }
                None => next,
            };
            outputs.push(h.clone());
        }
        Ok(outputs)
    }
}

/// Max-pool with width 2, stride 1 and left padding, keeping length:
/// `y[t] = max(x[t-1], x[t])`, `y[0] = x[0]`. `x`: `[B, C, T]`.
pub fn max_pool_same(x: &Tensor) -> Result<Tensor> {
    let len = x.dim(2)?;
    if len < 2 {
        return Ok(x.clone());
    }
    let shifted = Tensor::cat(&[&x.narrow(2, 0, 1)?, &x.narrow(2, 0, len - 1)?], 2)?;
    x.maximum(&shifted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn max_pool_keeps_length() {
        let x = Tensor::new(&[[[1f32, 3.0, 2.0, 0.0]]], &Device::Cpu).unwrap();
        let y = max_pool_same(&x).unwrap();
        assert_eq!(y.to_vec3::<f32>().unwrap(), vec![vec![vec![1.0, 3.0, 3.0, 2.0]]]);
    }

    #[test]
    fn batchnorm_conv_preserves_length_for_even_kernels() {
        let varmap = VarMap::new();
        let conv = BatchNormConv::new(3, 5, 4, true, vb(&varmap).pp("c")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 7), &Device::Cpu).unwrap();
        assert_eq!(conv.forward(&x, false).unwrap().dims(), &[2, 5, 7]);
        assert_eq!(conv.forward(&x, true).unwrap().dims(), &[2, 5, 7]);
    }

    #[test]
    fn batchnorm_conv_backward_on_sequences_shorter_than_kernel() {
        let varmap = VarMap::new();
        let conv = BatchNormConv::new(3, 4, 31, true, vb(&varmap).pp("c")).unwrap();
        for len in [1, 4, 16] {
            let x = Tensor::randn(0f32, 1.0, (2, 3, len), &Device::Cpu).unwrap();
            let y = conv.forward(&x, true).unwrap();
            assert_eq!(y.dims(), &[2, 4, len]);
            let grads = y.sqr().unwrap().sum_all().unwrap().backward().unwrap();
            let weight = varmap.data().lock().unwrap()["c.conv.weight"].clone();
            let grad = grads.get(weight.as_tensor()).unwrap();
            assert_eq!(grad.dims(), &[4, 3, 31]);
        }
    }

    #[test]
    fn same_padding_splits_even_kernels_left_heavy() {
        let x = Tensor::ones((1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let padded = same_padding(&x, 4).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(padded[0][0], vec![0.0, 0.0, 1.0, 1.0, 0.0]);
        let padded = same_padding(&x, 1).unwrap();
        assert_eq!(padded.dims(), &[1, 1, 2]);
    }

    #[test]
    fn highway_zero_gate_passes_input_through() {
        let varmap = VarMap::new();
        let hw = Highway::new(4, vb(&varmap).pp("hw")).unwrap();
        // Drive the gate to zero: W2 = 0, b2 = -100.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name == "hw.w2.weight" {
                var.set(&var.zeros_like().unwrap()).unwrap();
            } else if name == "hw.w2.bias" {
                var.set(&(var.zeros_like().unwrap() - 100.0).unwrap()).unwrap();
            }
        }
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0, 0.0]], &Device::Cpu).unwrap();
        let y = hw.forward(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn lstm_and_gru_shapes() {
        let varmap = VarMap::new();
        let gru = GruCell::new(3, 6, vb(&varmap).pp("gru")).unwrap();
        let lstm = LstmCell::new(3, 5, vb(&varmap).pp("lstm")).unwrap();
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let h = gru.step(&x, &Tensor::zeros((2, 6), DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(h.dims(), &[2, 6]);
        let z = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        let (h, c) = lstm.step(&x, &z, &z).unwrap();
        assert_eq!(h.dims(), &[2, 5]);
        assert_eq!(c.dims(), &[2, 5]);
    }

    #[test]
    fn zoneout_is_identity_outside_training() {
        let prev = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let next = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = zoneout(&prev, &next, 0.5, false).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0; 3]; 2]);
        // In training every unit is either kept or replaced.
        let out = zoneout(&prev, &next, 0.5, true).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn bigru_backward_pass_ignores_padding() {
        let varmap = VarMap::new();
        let rnn = BiGru::new(2, 3, vb(&varmap).pp("rnn")).unwrap();
        let valid = Tensor::randn(0f32, 1.0, (1, 3, 2), &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 2), &Device::Cpu).unwrap();
        let padded = Tensor::cat(&[&valid, &noise], 1).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0, 0.0]], &Device::Cpu).unwrap();

        let short = rnn.forward(&valid, None).unwrap();
        let long = rnn.forward(&padded, Some(&mask)).unwrap().narrow(1, 0, 3).unwrap();
        let diff = (short - long).unwrap().abs().unwrap().flatten_all().unwrap();
        let max = diff.max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(max < 1e-5, "padded positions leaked into valid outputs: {max}");
    }
}
