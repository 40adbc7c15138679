//! Batch collation.
//!
//! Tokens are right-padded with [`PAD_ID`]. Mels are right-padded with the
//! silence value to `max_frames + 1` rounded up to a multiple of `r`, so every
//! item carries at least one padded frame and teacher forcing consumes whole
//! `r`-frame groups.

use candle_core::{DType, Device, Tensor};

use super::dataset::Sample;
use crate::text::PAD_ID;
use crate::{Error, Result};

/// A padded batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, L]` u32
    pub tokens: Tensor,
    /// `[B, n_mels, T]`, `T % r == 0`
    pub mels: Tensor,
    /// `[B, speaker_dims]`
    pub embeddings: Tensor,
    pub text_lengths: Vec<usize>,
    pub mel_lengths: Vec<usize>,
    pub token_ids: Vec<Vec<u32>>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.mel_lengths.len()
    }
}

/// Padded mel length for a batch whose longest item has `max_frames`.
pub fn padded_frames(max_frames: usize, r: usize) -> usize {
    (max_frames + 1).div_ceil(r) * r
}

pub fn collate(samples: &[Sample], r: usize, pad_value: f32, device: &Device) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::InvalidInput("cannot collate an empty batch".into()));
    }
    if r == 0 {
        return Err(Error::InvalidInput("reduction factor must be >= 1".into()));
    }

    let text_lengths: Vec<usize> = samples.iter().map(|s| s.tokens.len()).collect();
    let max_text = text_lengths.iter().copied().max().unwrap_or(0);
    let mut ids = Vec::with_capacity(samples.len() * max_text);
    for s in samples {
        ids.extend_from_slice(&s.tokens);
        ids.extend(std::iter::repeat_n(PAD_ID, max_text - s.tokens.len()));
    }
    let tokens = Tensor::from_vec(ids, (samples.len(), max_text), device)?;

    let mel_lengths = samples
        .iter()
        .map(|s| s.mel.dim(1))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let total = padded_frames(mel_lengths.iter().copied().max().unwrap_or(0), r);
    let mels = samples
        .iter()
        .zip(&mel_lengths)
        .map(|(s, &len)| {
            let n_mels = s.mel.dim(0)?;
            let pad = Tensor::full(pad_value, (n_mels, total - len), s.mel.device())?;
            Tensor::cat(&[&s.mel.to_dtype(DType::F32)?, &pad], 1)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mels = Tensor::stack(&mels, 0)?.to_device(device)?;

    let embeddings = samples.iter().map(|s| s.embedding.clone()).collect::<Vec<_>>();
    let embeddings = Tensor::stack(&embeddings, 0)?.to_device(device)?;

    Ok(Batch {
        tokens,
        mels,
        embeddings,
        text_lengths,
        mel_lengths,
        token_ids: samples.iter().map(|s| s.tokens.clone()).collect(),
    })
}
