//! Location-sensitive attention.
//!
//! ```text
//! loc   = L(conv(cumulative))               conv: 1 → filters, kernel k, same padding
//! u     = v · tanh(W·query + enc_proj + loc)
//! u     = u + mask_bias                     padded tokens → −1e9
//! align = softmax(u)
//! cumulative += align
//! ```

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder, ops};

use super::layers::same_padding;

/// Additive score bias for padded encoder positions.
const MASKED_SCORE: f64 = -1e9;

#[derive(Debug, Clone)]
pub struct LocationSensitiveAttention {
    conv: Conv1d,
    kernel: usize,
    l: Linear,
    w: Linear,
    v: Linear,
}

impl LocationSensitiveAttention {
    pub fn new(attn_dims: usize, filters: usize, kernel: usize, vb: VarBuilder) -> Result<Self> {
        if kernel % 2 == 0 {
            candle_core::bail!("location kernel must be odd, got {kernel}");
        }
        let cfg = Conv1dConfig::default();
        Ok(Self {
            conv: candle_nn::conv1d(1, filters, kernel, cfg, vb.pp("conv"))?,
            kernel,
            l: candle_nn::linear_no_bias(filters, attn_dims, vb.pp("L"))?,
            w: candle_nn::linear(attn_dims, attn_dims, vb.pp("W"))?,
            v: candle_nn::linear_no_bias(attn_dims, 1, vb.pp("v"))?,
        })
    }

    /// One attention step.
    ///
    /// - `enc_proj`: `[B, L, attn_dims]` projected encoder outputs
    /// - `query`: `[B, attn_dims]`
    /// - `cumulative`: `[B, L]` sum of earlier alignments
    /// - `mask_bias`: `[B, L]`, from [`mask_bias`]
    ///
    /// Returns `(alignment, cumulative + alignment)`, both `[B, L]`.
    pub fn forward(
        &self,
        enc_proj: &Tensor,
        query: &Tensor,
        cumulative: &Tensor,
        mask_bias: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let processed_query = self.w.forward(query)?.unsqueeze(1)?;
        let location = self
            .conv
            .forward(&same_padding(&cumulative.unsqueeze(1)?, self.kernel)?)?
            .transpose(1, 2)?
            .contiguous()?;
        let processed_loc = self.l.forward(&location)?;

        let energies = enc_proj
            .broadcast_add(&processed_query)?
            .add(&processed_loc)?
            .tanh()?;
        let u = self.v.forward(&energies)?.squeeze(2)?;
        let u = (u + mask_bias)?;
        let alignment = ops::softmax(&u, D::Minus1)?;
        let cumulative = (cumulative + &alignment)?;
        Ok((alignment, cumulative))
    }
}

/// `[B, L]` validity mask → additive score bias (0 on valid, −1e9 on padding).
pub fn mask_bias(mask: &Tensor) -> Result<Tensor> {
    mask.affine(-MASKED_SCORE, MASKED_SCORE)
}
