//! Full Tacotron: encoder → attention decoder → CBHG postnet.
//!
//! ```text
//! tokens [B, L], speaker [B, 256]
//!   → Encoder                                     [B, L, 2·encoder_dims + 256]
//!   → encoder_proj (no bias)                      [B, L, decoder_dims]
//!   → decoder loop (r frames / step)              coarse [B, n_mels, steps·r]
//!   → postnet CBHG + post_proj (no bias)          residual [B, n_mels, steps·r]
//!   → refined = coarse + residual
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! encoder.embedding.weight
//! encoder.prenet.{fc1,fc2}.{weight,bias}
//! encoder.cbhg.bank.{k}.conv.weight, encoder.cbhg.bank.{k}.bnorm.*
//! encoder.cbhg.{proj1,proj2}.*, encoder.cbhg.highways.{i}.{w1,w2}.*
//! encoder.cbhg.rnn.{forward,backward}.{ih,hh}.{weight,bias}
//! encoder_proj.weight
//! decoder.{prenet,attn_rnn,attention,rnn_input,res_rnn1,res_rnn2,mel_proj,stop_proj}.*
//! postnet.*  (same layout as encoder.cbhg)
//! post_proj.weight
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::cbhg::Cbhg;
use super::decoder::{
    Autoregressive, Decoder, DecoderRun, EncoderMemory, StopReason, TeacherForced, run_decoder,
};
use super::encoder::{Encoder, token_mask};
use crate::config::{InferenceConfig, TacotronConfig};
use crate::text::num_symbols;
use crate::{Error, Result};

/// Teacher-forced forward pass outputs.
#[derive(Debug, Clone)]
pub struct TacotronOutput {
    /// `[B, n_mels, steps·r]`
    pub coarse: Tensor,
    /// `[B, n_mels, steps·r]`
    pub refined: Tensor,
    /// `[B, steps, L]`
    pub alignments: Tensor,
    /// `[B, steps]`
    pub stop_logits: Tensor,
}

/// Free-running generation outputs.
#[derive(Debug, Clone)]
pub struct Generated {
    /// `[B, n_mels, T]`, unscaled.
    pub coarse: Tensor,
    /// `[B, n_mels, T]`, unscaled.
    pub refined: Tensor,
    /// `[B, steps, L]`
    pub alignments: Tensor,
    /// `[B, steps]`
    pub stop_logits: Tensor,
    pub decoder_steps: usize,
    pub stop_reason: StopReason,
}

/// Settings for [`Tacotron::generate`].
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub stop_threshold: f32,
    pub max_frames: usize,
    pub min_frames_before_stop: usize,
    pub prenet_dropout: bool,
}

impl GenerateOptions {
    pub fn new(model: &TacotronConfig, inference: &InferenceConfig) -> Self {
        Self {
            stop_threshold: model.stop_threshold,
            max_frames: inference.max_generation_frames,
            min_frames_before_stop: inference.min_frames_before_stop,
            prenet_dropout: inference.prenet_dropout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tacotron {
    encoder: Encoder,
    encoder_proj: Linear,
    decoder: Decoder,
    postnet: Cbhg,
    post_proj: Linear,
    config: TacotronConfig,
    r: usize,
}

impl Tacotron {
    pub fn new(config: &TacotronConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(config, num_symbols(), vb.pp("encoder"))?;
        let encoder_proj = candle_nn::linear_no_bias(
            encoder.output_dims(),
            config.decoder_dims,
            vb.pp("encoder_proj"),
        )?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        let postnet = Cbhg::new(
            config.postnet_k,
            config.num_mels,
            config.postnet_dims,
            [config.postnet_dims, config.num_mels],
            config.num_highways,
            vb.pp("postnet"),
        )?;
        let post_proj =
            candle_nn::linear_no_bias(postnet.output_dims(), config.num_mels, vb.pp("post_proj"))?;

        Ok(Self {
            encoder,
            encoder_proj,
            decoder,
            postnet,
            post_proj,
            config: config.clone(),
            r: 1,
        })
    }

    pub fn config(&self) -> &TacotronConfig {
        &self.config
    }

    pub fn reduction_factor(&self) -> usize {
        self.r
    }

    pub fn set_reduction_factor(&mut self, r: usize) -> Result<()> {
        if r == 0 || r > self.config.max_r {
            return Err(Error::Config(format!(
                "reduction factor {r} outside 1..={}",
                self.config.max_r
            )));
        }
        self.r = r;
        Ok(())
    }

    /// Encode tokens `[B, L]` (u32, zero-padded) with speakers `[B, 256]`.
    pub fn encode(
        &self,
        tokens: &Tensor,
        speaker: &Tensor,
        train: bool,
        dropout: bool,
    ) -> Result<EncoderMemory> {
        let (batch, len) = tokens.dims2()?;
        if len == 0 {
            return Err(Error::InvalidInput("empty token sequence".into()));
        }
        let speaker_dims = speaker.dims2()?;
        if speaker_dims != (batch, self.config.speaker_embedding_size) {
            return Err(Error::InvalidInput(format!(
                "speaker embeddings have shape {speaker_dims:?}, expected ({batch}, {})",
                self.config.speaker_embedding_size
            )));
        }
        let mask = token_mask(tokens)?;
        let seq = self.encoder.forward(tokens, speaker, &mask, train, dropout)?;
        let proj = self.encoder_proj.forward(&seq)?;
        EncoderMemory::new(seq, proj, &mask)
    }

    /// Teacher-forced pass over targets `[B, n_mels, T]`.
    ///
    /// Runs `ceil(T / r)` decoder steps and returns `r·ceil(T / r)` frames.
    /// `train` enables dropout, zoneout and batch statistics.
    pub fn forward(
        &self,
        tokens: &Tensor,
        targets: &Tensor,
        speaker: &Tensor,
        train: bool,
    ) -> Result<TacotronOutput> {
        let memory = self.encode(tokens, speaker, train, train)?;
        let pass = self.decoder.pass(self.r, train, train);
        let run = run_decoder(&pass, &memory, &TeacherForced { targets })?;
        let refined = self.postnet(&run.frames, train)?;
        Ok(TacotronOutput {
            coarse: run.frames,
            refined,
            alignments: run.alignments,
            stop_logits: run.stop_logits,
        })
    }

    /// Free-running generation. Stops on the threshold rule or after
    /// `options.max_frames / r` steps.
    pub fn generate(
        &self,
        tokens: &Tensor,
        speaker: &Tensor,
        options: &GenerateOptions,
    ) -> Result<Generated> {
        let memory = self.encode(tokens, speaker, false, options.prenet_dropout)?;
        let pass = self.decoder.pass(self.r, false, options.prenet_dropout);
        let source = Autoregressive {
            stop_threshold: options.stop_threshold,
            max_frames: options.max_frames,
            min_frames: options.min_frames_before_stop,
        };
        let DecoderRun {
            frames,
            alignments,
            stop_logits,
            decoder_steps,
            stop_reason,
            ..
        } = run_decoder(&pass, &memory, &source)?;
        let refined = self.postnet(&frames, false)?;
        Ok(Generated {
            coarse: frames,
            refined,
            alignments,
            stop_logits,
            decoder_steps,
            stop_reason,
        })
    }

    /// `coarse + post_proj(CBHG(coarse))`, all `[B, n_mels, T]`.
    pub fn postnet(&self, coarse: &Tensor, train: bool) -> Result<Tensor> {
        let residual = self.postnet.forward(coarse, None, train)?;
        let residual = self.post_proj.forward(&residual)?.transpose(1, 2)?;
        Ok((coarse + residual)?)
    }
}

/// `[B, T]` frame mask: valid frames plus the first padded frame, so the
/// model learns to emit padding-level values after an utterance ends.
pub fn frame_mask(lengths: &[usize], total: usize, device: &candle_core::Device) -> Result<Tensor> {
    let data: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..total).map(move |t| if t <= len { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(data, (lengths.len(), total), device)?)
}

/// Mean absolute error over masked frames. `pred`, `target`: `[B, n_mels, T]`,
/// `mask`: `[B, T]`.
pub fn masked_l1(pred: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let n_mels = pred.dim(1)?;
    let mask = mask.unsqueeze(1)?.to_dtype(DType::F32)?;
    let err = (pred - target)?.abs()?.broadcast_mul(&mask)?.sum_all()?;
    let count = (mask.sum_all()? * n_mels as f64)?;
    Ok(err.div(&count)?)
}

/// Training loss `L1(coarse) + L1(refined)`.
pub fn mel_loss(output: &TacotronOutput, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let frames = targets.dim(2)?;
    if output.coarse.dim(2)? != frames {
        return Err(Error::InvalidInput(format!(
            "targets have {frames} frames but the decoder produced {}; pad targets to a multiple of r",
            output.coarse.dim(2)?
        )));
    }
    let coarse = masked_l1(&output.coarse, targets, mask)?;
    let refined = masked_l1(&output.refined, targets, mask)?;
    Ok((coarse + refined)?)
}
