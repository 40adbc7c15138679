//! Inference driver: text + speaker embedding → mel spectrogram.
//!
//! ```text
//! checkpoint (.safetensors) → Tacotron (r from the checkpoint)
//! text → cleaners → symbol ids ─┐
//! speaker embedding [256] ──────┴→ generate → refined mel / max_abs_value, clamped to [-1, 1]
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Serialize;

use crate::audio::{AudioProcessor, load_preprocess_wav};
use crate::config::HParams;
use crate::model::{GenerateOptions, StopReason, Tacotron};
use crate::text::text_to_sequence;
use crate::train::checkpoint::{parameter_tensors, read_checkpoint};
use crate::{Error, Result};

/// One synthesized utterance.
#[derive(Debug, Clone)]
pub struct SynthesizedMel {
    /// `[n_mels, T]` on the CPU, scaled to `[-1, 1]`.
    pub mel: Tensor,
    /// `[decoder_steps, L]` when requested.
    pub alignment: Option<Tensor>,
    pub decoder_steps: usize,
    pub stop_reason: StopReason,
}

/// Per-utterance summary, printed by the `synthesize` binary.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisSummary {
    pub index: usize,
    pub frames: usize,
    pub decoder_steps: usize,
    pub stop_reason: StopReason,
}

impl SynthesizedMel {
    pub fn summary(&self, index: usize) -> Result<SynthesisSummary> {
        Ok(SynthesisSummary {
            index,
            frames: self.mel.dim(1)?,
            decoder_steps: self.decoder_steps,
            stop_reason: self.stop_reason,
        })
    }
}

pub struct Synthesizer {
    model: Tacotron,
    hparams: HParams,
    audio: AudioProcessor,
    device: Device,
    step: u64,
}

impl Synthesizer {
    /// Load a training checkpoint for inference. The reduction factor is the
    /// one the checkpoint was saved with.
    pub fn load(checkpoint: impl AsRef<Path>, hparams: HParams, device: Device) -> Result<Self> {
        let checkpoint = checkpoint.as_ref();
        hparams.validate()?;
        tracing::info!(device = ?device, path = %checkpoint.display(), "loading synthesizer");

        let (tensors, meta) = read_checkpoint(checkpoint, &device)?;
        let vb = VarBuilder::from_tensors(parameter_tensors(tensors), DType::F32, &device);
        let mut model = Tacotron::new(&hparams.tacotron, vb).map_err(|e| {
            Error::Checkpoint(format!(
                "{} does not match the model configuration: {e}",
                checkpoint.display()
            ))
        })?;
        model.set_reduction_factor(meta.r)?;
        tracing::info!(
            step = meta.step,
            r = meta.r,
            "loaded synthesizer trained to {}k steps",
            meta.step / 1000
        );

        let audio = AudioProcessor::new(hparams.audio.clone())?;
        Ok(Self {
            model,
            hparams,
            audio,
            device,
            step: meta.step,
        })
    }

    pub fn model(&self) -> &Tacotron {
        &self.model
    }

    /// Training step the loaded checkpoint was saved at.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn sample_rate(&self) -> u32 {
        self.hparams.audio.sample_rate
    }

    /// Synthesize one mel spectrogram per text.
    ///
    /// `embeddings` is `[N, speaker_dims]` (or `[speaker_dims]` for a single
    /// text). Utterances are generated one at a time.
    pub fn synthesize_spectrograms<S: AsRef<str>>(
        &self,
        texts: &[S],
        embeddings: &Tensor,
        return_alignments: bool,
    ) -> Result<Vec<SynthesizedMel>> {
        let embeddings = match embeddings.rank() {
            1 => embeddings.unsqueeze(0)?,
            2 => embeddings.clone(),
            rank => {
                return Err(Error::InvalidInput(format!(
                    "speaker embeddings must be [N, D] or [D], got rank {rank}"
                )));
            }
        };
        let count = embeddings.dim(0)?;
        if count != texts.len() {
            return Err(Error::InvalidInput(format!(
                "{} texts but {count} speaker embeddings",
                texts.len()
            )));
        }

        let options = GenerateOptions::new(&self.hparams.tacotron, &self.hparams.inference);
        let max_abs = self.hparams.audio.max_abs_value as f64;
        let mut outputs = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            tracing::info!("generating {}/{}", i + 1, texts.len());
            let ids = text_to_sequence(text.as_ref().trim(), &self.hparams.tacotron.cleaner_names)?;
            let tokens = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            let speaker = embeddings
                .get(i)?
                .to_dtype(DType::F32)?
                .to_device(&self.device)?
                .unsqueeze(0)?;

            let generated = self.model.generate(&tokens, &speaker, &options)?;
            if generated.stop_reason == StopReason::MaxLength {
                tracing::warn!(
                    utterance = i + 1,
                    frames = generated.refined.dim(2)?,
                    "stop criterion never fired, output truncated at the frame limit"
                );
            }
            let mel = (generated.refined.squeeze(0)? / max_abs)?
                .clamp(-1f32, 1f32)?
                .to_device(&Device::Cpu)?;
            let alignment = if return_alignments {
                Some(generated.alignments.squeeze(0)?.to_device(&Device::Cpu)?)
            } else {
                None
            };
            outputs.push(SynthesizedMel {
                mel,
                alignment,
                decoder_steps: generated.decoder_steps,
                stop_reason: generated.stop_reason,
            });
        }
        Ok(outputs)
    }

    /// Load a WAV the way training audio was prepared.
    pub fn load_preprocess_wav(&self, path: impl AsRef<Path>) -> Result<Vec<f32>> {
        load_preprocess_wav(path, &self.hparams.audio)
    }

    /// Mel spectrogram `[n_mels, T]` in the training feature domain.
    pub fn make_spectrogram(&self, wav: &[f32]) -> Result<Tensor> {
        let mel = self.audio.melspectrogram(wav);
        let frames = mel.first().map_or(0, Vec::len);
        let data: Vec<f32> = mel.into_iter().flatten().collect();
        Ok(Tensor::from_vec(data, (self.hparams.audio.num_mels, frames), &Device::Cpu)?)
    }

    /// Griffin-Lim rendering of a `[n_mels, T]` spectrogram as returned by
    /// [`Synthesizer::synthesize_spectrograms`].
    pub fn griffin_lim(&self, mel: &Tensor) -> Result<Vec<f32>> {
        let scaled = (mel.to_device(&Device::Cpu)?.to_dtype(DType::F32)?
            * self.hparams.audio.max_abs_value as f64)?;
        self.audio.inv_mel_spectrogram(&scaled.to_vec2::<f32>()?)
    }
}
