//! Evaluation exports written during training.
//!
//! For one item of the current batch: the attention matrix, the predicted
//! and target mel spectrograms (as `.npy`) and a Griffin-Lim rendering of the
//! prediction (as `.wav`). The decoded input text goes to the log.

use std::path::PathBuf;

use candle_core::{Device, Tensor};

use super::trainer::RunPaths;
use crate::Result;
use crate::audio::{AudioProcessor, write_wav};
use crate::data::Batch;
use crate::model::TacotronOutput;
use crate::text::sequence_to_text;

/// Text positions kept in the exported attention matrix.
const ATTENTION_COLUMNS: usize = 160;

/// Files produced by [`export_eval_sample`].
#[derive(Debug, Clone)]
pub struct EvalArtifacts {
    pub attention: PathBuf,
    pub mel: PathBuf,
    pub target: PathBuf,
    pub wav: PathBuf,
}

/// Export item `index` of `batch` at `step`. File names carry `index + 1`.
pub fn export_eval_sample(
    paths: &RunPaths,
    audio: &AudioProcessor,
    batch: &Batch,
    output: &TacotronOutput,
    index: usize,
    step: u64,
    loss: f32,
) -> Result<EvalArtifacts> {
    let sample_num = index + 1;
    let frames = batch.mel_lengths[index];

    let attention = output.alignments.get(index)?.to_device(&Device::Cpu)?;
    let columns = attention.dim(1)?.min(ATTENTION_COLUMNS);
    let attention = attention.narrow(1, 0, columns)?.contiguous()?;
    let attention_path = paths
        .plots
        .join(format!("attention_step_{step}_sample_{sample_num}.npy"));
    attention.write_npy(&attention_path)?;

    let mel = valid_frames(&output.refined, index, frames)?;
    let mel_path = paths
        .mel_spectrograms
        .join(format!("mel-prediction-step-{step}_sample_{sample_num}.npy"));
    mel.t()?.contiguous()?.write_npy(&mel_path)?;

    let target = valid_frames(&batch.mels, index, frames)?;
    let target_path = paths
        .plots
        .join(format!("step-{step}-target-spectrogram_sample_{sample_num}.npy"));
    target.t()?.contiguous()?.write_npy(&target_path)?;

    let wav = audio.inv_mel_spectrogram(&mel.to_vec2::<f32>()?)?;
    let wav_path = paths
        .wavs
        .join(format!("step-{step}-wave-from-mel_sample_{sample_num}.wav"));
    write_wav(&wav_path, &wav, audio.config().sample_rate)?;

    tracing::info!(
        step,
        sample = sample_num,
        loss,
        "input at step: {}",
        sequence_to_text(&batch.token_ids[index])
    );

    Ok(EvalArtifacts {
        attention: attention_path,
        mel: mel_path,
        target: target_path,
        wav: wav_path,
    })
}

/// `[n_mels, frames]` slice of item `index` of a `[B, n_mels, T]` tensor.
fn valid_frames(mels: &Tensor, index: usize, frames: usize) -> Result<Tensor> {
    let mel = mels.get(index)?.to_device(&Device::Cpu)?;
    let frames = frames.min(mel.dim(1)?);
    Ok(mel.narrow(1, 0, frames)?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use crate::data::{Sample, collate};
    use candle_core::DType;

    #[test]
    fn writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::create(dir.path(), "run").unwrap();
        let audio = AudioProcessor::new(AudioConfig {
            griffin_lim_iters: 2,
            ..AudioConfig::default()
        })
        .unwrap();

        let sample = Sample {
            tokens: vec![8, 5, 12, 12, 15, 1],
            mel: Tensor::full(-2f32, (80, 7), &Device::Cpu).unwrap(),
            embedding: Tensor::zeros(256, DType::F32, &Device::Cpu).unwrap(),
            text: String::new(),
        };
        let batch = collate(&[sample], 2, -4.0, &Device::Cpu).unwrap();
        let output = TacotronOutput {
            coarse: batch.mels.clone(),
            refined: batch.mels.clone(),
            alignments: Tensor::full(1f32 / 6.0, (1, 4, 6), &Device::Cpu).unwrap(),
            stop_logits: Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap(),
        };

        let artifacts = export_eval_sample(&paths, &audio, &batch, &output, 0, 2000, 0.5).unwrap();
        assert!(artifacts.wav.exists());
        assert_eq!(
            Tensor::read_npy(&artifacts.mel).unwrap().dims(),
            &[7, 80]
        );
        assert_eq!(
            Tensor::read_npy(&artifacts.attention).unwrap().dims(),
            &[4, 6]
        );
        assert!(artifacts.target.exists());
        assert!(artifacts.mel.ends_with("mel-prediction-step-2000_sample_1.npy"));
    }
}
