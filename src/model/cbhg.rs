//! CBHG: 1-D Convolution Bank + Highway network + bidirectional GRU.
//!
//! ```text
//! x: [B, C_in, T]
//!   → K × BatchNormConv(C_in → channels, k = 1..=K), concatenated   [B, K·channels, T]
//!   → max-pool (width 2, stride 1)
//!   → BatchNormConv(K·channels → proj[0], k=3, relu)
//!   → BatchNormConv(proj[0] → proj[1], k=3)
//!   → + x (residual, proj[1] == C_in)
//!   → Linear(proj[1] → channels, no bias) when widths differ
//!   → num_highways × Highway(channels)
//!   → BiGRU(channels)                                                [B, T, 2·channels]
//! ```

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::layers::{BatchNormConv, BiGru, Highway, max_pool_same};

#[derive(Debug, Clone)]
pub struct Cbhg {
    bank: Vec<BatchNormConv>,
    proj1: BatchNormConv,
    proj2: BatchNormConv,
    pre_highway: Option<Linear>,
    highways: Vec<Highway>,
    rnn: BiGru,
    channels: usize,
}

impl Cbhg {
    pub fn new(
        k: usize,
        in_channels: usize,
        channels: usize,
        proj_channels: [usize; 2],
        num_highways: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if proj_channels[1] != in_channels {
            candle_core::bail!(
                "CBHG residual needs proj output {} == input {in_channels}",
                proj_channels[1]
            );
        }
        let bank = (1..=k)
            .map(|kernel| {
                let vb = vb.pp(format!("bank.{kernel}"));
                BatchNormConv::new(in_channels, channels, kernel, true, vb)
            })
            .collect::<Result<Vec<_>>>()?;
        let proj1 = BatchNormConv::new(k * channels, proj_channels[0], 3, true, vb.pp("proj1"))?;
        let proj2 =
            BatchNormConv::new(proj_channels[0], proj_channels[1], 3, false, vb.pp("proj2"))?;
        let pre_highway = if proj_channels[1] != channels {
            Some(candle_nn::linear_no_bias(
                proj_channels[1],
                channels,
                vb.pp("pre_highway"),
            )?)
        } else {
            None
        };
        let highways = (0..num_highways)
            .map(|i| Highway::new(channels, vb.pp(format!("highways.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let rnn = BiGru::new(channels, channels, vb.pp("rnn"))?;

        Ok(Self {
            bank,
            proj1,
            proj2,
            pre_highway,
            highways,
            rnn,
            channels,
        })
    }

    /// Output width (`2 · channels`).
    pub fn output_dims(&self) -> usize {
        2 * self.channels
    }

    /// `x`: `[B, C_in, T]`, `mask`: optional `[B, T]` validity mask for the GRU.
    /// Returns `[B, T, 2·channels]`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let residual = x;
        let bank = self
            .bank
            .iter()
            .map(|conv| conv.forward(x, train))
            .collect::<Result<Vec<_>>>()?;
        let y = Tensor::cat(&bank, 1)?;
        let y = max_pool_same(&y)?;
        let y = self.proj1.forward(&y, train)?;
        let y = self.proj2.forward(&y, train)?;
        let y = (y + residual)?;

        let mut y = y.transpose(1, 2)?.contiguous()?;
        if let Some(pre) = &self.pre_highway {
            y = pre.forward(&y)?;
        }
        for highway in &self.highways {
            y = highway.forward(&y)?;
        }
        self.rnn.forward(&y, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_shape_with_and_without_pre_highway() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        // Encoder-style: projections match channels.
        let enc = Cbhg::new(4, 8, 8, [8, 8], 2, vb.pp("enc")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 5), &Device::Cpu).unwrap();
        assert_eq!(enc.forward(&x, None, false).unwrap().dims(), &[2, 5, 16]);

        // Postnet-style: last projection returns to the input width.
        let post = Cbhg::new(3, 6, 10, [10, 6], 1, vb.pp("post")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 6, 9), &Device::Cpu).unwrap();
        assert_eq!(post.forward(&x, None, true).unwrap().dims(), &[1, 9, 20]);
        assert_eq!(post.output_dims(), 20);
    }

    #[test]
    fn mismatched_residual_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Cbhg::new(2, 8, 8, [8, 4], 1, vb).is_err());
    }
}
