//! Text encoder.
//!
//! ```text
//! tokens [B, L]
//!   → Embedding(num_symbols, embed_dims)
//!   → PreNet(embed_dims → encoder_dims → encoder_dims)
//!   → CBHG(K = encoder_k, channels = encoder_dims)          [B, L, 2·encoder_dims]
//!   → ⊕ speaker embedding, repeated per position             [B, L, 2·encoder_dims + 256]
//! ```

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::cbhg::Cbhg;
use super::layers::PreNet;
use crate::config::TacotronConfig;
use crate::text::PAD_ID;

#[derive(Debug, Clone)]
pub struct Encoder {
    embedding: Embedding,
    prenet: PreNet,
    cbhg: Cbhg,
    speaker_dims: usize,
}

impl Encoder {
    pub fn new(cfg: &TacotronConfig, num_symbols: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedding: candle_nn::embedding(num_symbols, cfg.embed_dims, vb.pp("embedding"))?,
            prenet: PreNet::new(
                cfg.embed_dims,
                cfg.encoder_dims,
                cfg.encoder_dims,
                cfg.dropout,
                vb.pp("prenet"),
            )?,
            cbhg: Cbhg::new(
                cfg.encoder_k,
                cfg.encoder_dims,
                cfg.encoder_dims,
                [cfg.encoder_dims, cfg.encoder_dims],
                cfg.num_highways,
                vb.pp("cbhg"),
            )?,
            speaker_dims: cfg.speaker_embedding_size,
        })
    }

    /// Width of each output vector.
    pub fn output_dims(&self) -> usize {
        self.cbhg.output_dims() + self.speaker_dims
    }

    /// - `tokens`: `[B, L]` u32, zero-padded
    /// - `speaker`: `[B, speaker_dims]`
    /// - `mask`: `[B, L]` f32, 1 on real tokens
    ///
    /// Returns `[B, L, output_dims]`.
    pub fn forward(
        &self,
        tokens: &Tensor,
        speaker: &Tensor,
        mask: &Tensor,
        train: bool,
        dropout: bool,
    ) -> Result<Tensor> {
        let (batch, len) = tokens.dims2()?;
        let x = self.embedding.forward(tokens)?;
        let x = self.prenet.forward(&x, dropout)?;
        let x = x.transpose(1, 2)?.contiguous()?;
        let x = self.cbhg.forward(&x, Some(mask), train)?;

        let speaker = speaker
            .unsqueeze(1)?
            .broadcast_as((batch, len, self.speaker_dims))?
            .contiguous()?;
        Tensor::cat(&[&x, &speaker], 2)
    }
}

/// `[B, L]` f32 mask: 1 where `tokens != PAD_ID`.
pub fn token_mask(tokens: &Tensor) -> Result<Tensor> {
    tokens.ne(PAD_ID)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config() -> TacotronConfig {
        TacotronConfig {
            embed_dims: 8,
            encoder_dims: 6,
            encoder_k: 3,
            num_highways: 1,
            speaker_embedding_size: 4,
            ..TacotronConfig::default()
        }
    }

    #[test]
    fn output_carries_speaker_embedding() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = small_config();
        let encoder = Encoder::new(&cfg, 10, vb).unwrap();

        let tokens = Tensor::new(&[[3u32, 4, 1, 0], [5, 6, 7, 1]], &Device::Cpu).unwrap();
        let mask = token_mask(&tokens).unwrap();
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0, 0.0], vec![1.0; 4]]
        );
        let speaker =
            Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [0.0, 0.0, 0.0, 1.0]], &Device::Cpu).unwrap();

        let out = encoder.forward(&tokens, &speaker, &mask, false, false).unwrap();
        assert_eq!(out.dims(), &[2, 4, 2 * 6 + 4]);
        assert_eq!(encoder.output_dims(), 16);
        let tail = out.narrow(2, 12, 4).unwrap().to_vec3::<f32>().unwrap();
        assert!(tail[0].iter().all(|v| v == &vec![1.0, 2.0, 3.0, 4.0]));
        assert!(tail[1].iter().all(|v| v == &vec![0.0, 0.0, 0.0, 1.0]));
    }
}
