//! Autoregressive attention decoder.
//!
//! A decode run is a small state machine `INITIAL → STEPPING → STOPPED`.
//! [`run_decoder`] drives it: it asks a [`FrameSource`] for the frame that
//! feeds the next step, calls [`DecoderStep::advance`] once per step and
//! asks the source again whether to stop. Teacher forcing and free-running
//! generation differ only in the source:
//!
//! - [`TeacherForced`] — the previous frame comes from the target, no early stop
//! - [`Autoregressive`] — the previous frame is the last one predicted; stops
//!   when a whole `r`-frame group falls below the stop threshold
//!
//! One decoder step:
//!
//! ```text
//! prev_frame [B, n_mels] → PreNet → ⊕ context → attention GRU cell
//!   → location-sensitive attention → context = align · encoder_seq
//!   → Linear(context ⊕ attn_hidden → lstm_dims)
//!   → residual LSTM ×2 (zoneout in training)
//!   → mel_proj (lstm_dims → n_mels·max_r), first r frames    [B, n_mels, r]
//!   → stop_proj (lstm_dims ⊕ context → 1)
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::attention::{LocationSensitiveAttention, mask_bias};
use super::layers::{GruCell, LstmCell, PreNet, zoneout};
use crate::config::TacotronConfig;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Encoder memory
// ---------------------------------------------------------------------------

/// Encoder outputs the decoder attends over, fixed for a whole run.
#[derive(Debug, Clone)]
pub struct EncoderMemory {
    /// `[B, L, enc_dims]`, includes the speaker embedding.
    pub seq: Tensor,
    /// `[B, L, decoder_dims]`
    pub proj: Tensor,
    /// `[B, L]`, 0 on real tokens and −1e9 on padding.
    pub bias: Tensor,
}

impl EncoderMemory {
    pub fn new(seq: Tensor, proj: Tensor, mask: &Tensor) -> Result<Self> {
        let bias = mask_bias(mask)?;
        Ok(Self { seq, proj, bias })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.seq.dim(0)?)
    }

    pub fn encoder_steps(&self) -> Result<usize> {
        Ok(self.seq.dim(1)?)
    }
}

// ---------------------------------------------------------------------------
// Step primitive and frame sources
// ---------------------------------------------------------------------------

/// What one call to [`DecoderStep::advance`] produces.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[B, n_mels, r]`
    pub frames: Tensor,
    /// `[B, L]`, rows sum to 1.
    pub alignment: Tensor,
    /// `[B, 1]`
    pub stop_logit: Tensor,
}

/// A decoder that can be stepped one `r`-frame group at a time.
pub trait DecoderStep {
    type State;

    fn reduction_factor(&self) -> usize;
    fn n_mels(&self) -> usize;
    fn initial_state(&self, memory: &EncoderMemory) -> Result<Self::State>;
    /// Consume `prev_frame` (`[B, n_mels]`) and emit the next `r` frames.
    fn advance(
        &self,
        state: &mut Self::State,
        memory: &EncoderMemory,
        prev_frame: &Tensor,
    ) -> Result<StepOutput>;
}

/// Supplies the frame fed into each step and decides when to stop.
pub trait FrameSource {
    /// Step budget for reduction factor `r`.
    fn max_steps(&self, r: usize) -> usize;

    /// Frame that feeds step `step`, given the frames emitted by the previous
    /// step (`[B, n_mels, r]`). `None` means the all-zero go frame.
    fn previous_frame(
        &self,
        step: usize,
        r: usize,
        last: Option<&Tensor>,
    ) -> Result<Option<Tensor>>;

    /// Called after each step with the number of frames emitted before it
    /// and the step's frames.
    fn should_stop(&self, frames_before: usize, frames: &Tensor) -> Result<bool>;
}

/// Teacher forcing: step `i` is fed target frame `i·r - 1`.
pub struct TeacherForced<'a> {
    /// `[B, n_mels, T]`
    pub targets: &'a Tensor,
}

impl FrameSource for TeacherForced<'_> {
    fn max_steps(&self, r: usize) -> usize {
        self.targets.dims().get(2).map_or(0, |t| t.div_ceil(r))
    }

    fn previous_frame(
        &self,
        step: usize,
        r: usize,
        _last: Option<&Tensor>,
    ) -> Result<Option<Tensor>> {
        if step == 0 {
            return Ok(None);
        }
        Ok(Some(self.targets.narrow(2, step * r - 1, 1)?.squeeze(2)?))
    }

    fn should_stop(&self, _frames_before: usize, _frames: &Tensor) -> Result<bool> {
        Ok(false)
    }
}

/// Free-running generation with the threshold stop rule.
#[derive(Debug, Clone, Copy)]
pub struct Autoregressive {
    pub stop_threshold: f32,
    /// Emitted frames never exceed this.
    pub max_frames: usize,
    /// The stop rule is only consulted once more than this many frames exist.
    pub min_frames: usize,
}

impl FrameSource for Autoregressive {
    fn max_steps(&self, r: usize) -> usize {
        self.max_frames / r
    }

    fn previous_frame(
        &self,
        _step: usize,
        r: usize,
        last: Option<&Tensor>,
    ) -> Result<Option<Tensor>> {
        match last {
            Some(frames) => Ok(Some(frames.narrow(2, r - 1, 1)?.squeeze(2)?)),
            None => Ok(None),
        }
    }

    fn should_stop(&self, frames_before: usize, frames: &Tensor) -> Result<bool> {
        if frames_before <= self.min_frames {
            return Ok(false);
        }
        let max = frames
            .flatten_all()?
            .max(0)?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        Ok(max < self.stop_threshold)
    }
}

// ---------------------------------------------------------------------------
// Run driver
// ---------------------------------------------------------------------------

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A step's frames all fell below the stop threshold.
    Threshold,
    /// The step budget ran out.
    MaxLength,
}

/// Result of a full decode run.
#[derive(Debug, Clone)]
pub struct DecoderRun {
    /// `[B, n_mels, decoder_steps·r]`
    pub frames: Tensor,
    /// `[B, decoder_steps, L]`
    pub alignments: Tensor,
    /// `[B, decoder_steps]`
    pub stop_logits: Tensor,
    pub decoder_steps: usize,
    pub frames_emitted: usize,
    pub stop_reason: StopReason,
}

/// Drive `decoder` from its initial state until `source` says stop or its
/// step budget is exhausted.
pub fn run_decoder<D: DecoderStep, S: FrameSource>(
    decoder: &D,
    memory: &EncoderMemory,
    source: &S,
) -> Result<DecoderRun> {
    let r = decoder.reduction_factor();
    let max_steps = source.max_steps(r);
    if max_steps == 0 {
        return Err(Error::InvalidInput(format!(
            "decoder step budget is zero for r={r}"
        )));
    }

    let batch = memory.batch_size()?;
    let go_frame = Tensor::zeros(
        (batch, decoder.n_mels()),
        DType::F32,
        memory.seq.device(),
    )?;
    let mut state = decoder.initial_state(memory)?;
    let mut frames: Vec<Tensor> = Vec::new();
    let mut alignments = Vec::new();
    let mut stop_logits = Vec::new();
    let mut stop_reason = StopReason::MaxLength;

    for step in 0..max_steps {
        let prev = source
            .previous_frame(step, r, frames.last())?
            .unwrap_or_else(|| go_frame.clone());
        let out = decoder.advance(&mut state, memory, &prev)?;
        let stop = source.should_stop(step * r, &out.frames)?;
        frames.push(out.frames);
        alignments.push(out.alignment);
        stop_logits.push(out.stop_logit);
        if stop {
            stop_reason = StopReason::Threshold;
            break;
        }
    }

    let decoder_steps = frames.len();
    Ok(DecoderRun {
        frames: Tensor::cat(&frames, 2)?,
        alignments: Tensor::stack(&alignments, 1)?,
        stop_logits: Tensor::cat(&stop_logits, 1)?,
        decoder_steps,
        frames_emitted: decoder_steps * r,
        stop_reason,
    })
}

// ---------------------------------------------------------------------------
// Decoder network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Decoder {
    prenet: PreNet,
    attn_rnn: GruCell,
    attention: LocationSensitiveAttention,
    rnn_input: Linear,
    res_rnn1: LstmCell,
    res_rnn2: LstmCell,
    mel_proj: Linear,
    stop_proj: Linear,
    n_mels: usize,
    max_r: usize,
    decoder_dims: usize,
    lstm_dims: usize,
    encoder_dims: usize,
    zoneout: f32,
}

/// Recurrent state carried between steps.
#[derive(Debug, Clone)]
pub struct DecoderState {
    attn_hidden: Tensor,
    rnn1: (Tensor, Tensor),
    rnn2: (Tensor, Tensor),
    context: Tensor,
    cumulative: Tensor,
}

impl Decoder {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let enc = cfg.encoder_output_dims();
        let prenet_out = cfg.decoder_prenet_dims();
        Ok(Self {
            prenet: PreNet::new(
                cfg.num_mels,
                cfg.decoder_dims,
                prenet_out,
                cfg.dropout,
                vb.pp("prenet"),
            )?,
            attn_rnn: GruCell::new(enc + prenet_out, cfg.decoder_dims, vb.pp("attn_rnn"))?,
            attention: LocationSensitiveAttention::new(
                cfg.decoder_dims,
                cfg.attention_filters,
                cfg.attention_kernel,
                vb.pp("attention"),
            )?,
            rnn_input: candle_nn::linear(
                enc + cfg.decoder_dims,
                cfg.lstm_dims,
                vb.pp("rnn_input"),
            )?,
            res_rnn1: LstmCell::new(cfg.lstm_dims, cfg.lstm_dims, vb.pp("res_rnn1"))?,
            res_rnn2: LstmCell::new(cfg.lstm_dims, cfg.lstm_dims, vb.pp("res_rnn2"))?,
            mel_proj: candle_nn::linear_no_bias(
                cfg.lstm_dims,
                cfg.num_mels * cfg.max_r,
                vb.pp("mel_proj"),
            )?,
            stop_proj: candle_nn::linear(cfg.lstm_dims + enc, 1, vb.pp("stop_proj"))?,
            n_mels: cfg.num_mels,
            max_r: cfg.max_r,
            decoder_dims: cfg.decoder_dims,
            lstm_dims: cfg.lstm_dims,
            encoder_dims: enc,
            zoneout: cfg.zoneout,
        })
    }

    /// Bind run-time flags for one decode run.
    ///
    /// `train` enables zoneout; `prenet_dropout` keeps pre-net dropout on.
    pub fn pass(&self, r: usize, train: bool, prenet_dropout: bool) -> DecoderPass<'_> {
        DecoderPass {
            decoder: self,
            r,
            train,
            prenet_dropout,
        }
    }
}

/// A [`Decoder`] bound to a reduction factor and train/inference flags.
#[derive(Debug, Clone, Copy)]
pub struct DecoderPass<'a> {
    decoder: &'a Decoder,
    r: usize,
    train: bool,
    prenet_dropout: bool,
}

impl DecoderStep for DecoderPass<'_> {
    type State = DecoderState;

    fn reduction_factor(&self) -> usize {
        self.r
    }

    fn n_mels(&self) -> usize {
        self.decoder.n_mels
    }

    fn initial_state(&self, memory: &EncoderMemory) -> Result<DecoderState> {
        let d = self.decoder;
        let batch = memory.batch_size()?;
        let device = memory.seq.device();
        let zeros = |dims: usize| Tensor::zeros((batch, dims), DType::F32, device);
        Ok(DecoderState {
            attn_hidden: zeros(d.decoder_dims)?,
            rnn1: (zeros(d.lstm_dims)?, zeros(d.lstm_dims)?),
            rnn2: (zeros(d.lstm_dims)?, zeros(d.lstm_dims)?),
            context: zeros(d.encoder_dims)?,
            cumulative: zeros(memory.encoder_steps()?)?,
        })
    }

    fn advance(
        &self,
        state: &mut DecoderState,
        memory: &EncoderMemory,
        prev_frame: &Tensor,
    ) -> Result<StepOutput> {
        let d = self.decoder;
        let batch = memory.batch_size()?;

        let prenet_out = d.prenet.forward(prev_frame, self.prenet_dropout)?;
        let attn_in = Tensor::cat(&[&state.context, &prenet_out], 1)?;
        state.attn_hidden = d.attn_rnn.step(&attn_in, &state.attn_hidden)?;

        let (alignment, cumulative) =
            d.attention
                .forward(&memory.proj, &state.attn_hidden, &state.cumulative, &memory.bias)?;
        state.cumulative = cumulative;
        state.context = alignment.unsqueeze(1)?.matmul(&memory.seq)?.squeeze(1)?;

        let x = Tensor::cat(&[&state.context, &state.attn_hidden], 1)?;
        let x = d.rnn_input.forward(&x)?;

        let (h1, c1) = d.res_rnn1.step(&x, &state.rnn1.0, &state.rnn1.1)?;
        let h1 = zoneout(&state.rnn1.0, &h1, d.zoneout, self.train)?;
        let x = (x + &h1)?;
        state.rnn1 = (h1, c1);

        let (h2, c2) = d.res_rnn2.step(&x, &state.rnn2.0, &state.rnn2.1)?;
        let h2 = zoneout(&state.rnn2.0, &h2, d.zoneout, self.train)?;
        let x = (x + &h2)?;
        state.rnn2 = (h2, c2);

        let frames = d
            .mel_proj
            .forward(&x)?
            .reshape((batch, d.n_mels, d.max_r))?
            .narrow(2, 0, self.r)?;
        let stop_logit = d.stop_proj.forward(&Tensor::cat(&[&x, &state.context], 1)?)?;

        Ok(StepOutput {
            frames,
            alignment,
            stop_logit,
        })
    }
}
