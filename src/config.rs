//! Hyper-parameters for the synthesizer.
//!
//! Defaults match the original SV2TTS synthesizer `hparams.py`. Every struct is
//! `#[serde(default)]`, so a JSON override file only needs the fields it
//! changes:
//!
//! ```json
//! { "training": { "eval_interval": -1 }, "inference": { "max_generation_frames": 1200 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Signal processing parameters shared by feature extraction and Griffin-Lim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub num_mels: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub fmin: f64,
    pub fmax: f64,
    /// Gradient explodes if too big, premature convergence if too small.
    pub max_abs_value: f32,
    pub min_level_db: f32,
    pub ref_level_db: f32,
    pub symmetric_mels: bool,
    pub signal_normalization: bool,
    pub allow_clipping_in_normalization: bool,
    pub preemphasize: bool,
    pub preemphasis: f32,
    pub rescale: bool,
    pub rescaling_max: f32,
    /// Magnitude exponent applied before Griffin-Lim.
    pub power: f32,
    pub griffin_lim_iters: usize,
    /// Fast Griffin-Lim momentum, `0.0` for the classic algorithm.
    pub griffin_lim_momentum: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 800,
            num_mels: 80,
            hop_length: 200,
            win_length: 800,
            fmin: 55.0,
            fmax: 8000.0,
            max_abs_value: 4.0,
            min_level_db: -100.0,
            ref_level_db: 20.0,
            symmetric_mels: true,
            signal_normalization: true,
            allow_clipping_in_normalization: true,
            preemphasize: true,
            preemphasis: 0.97,
            rescale: true,
            rescaling_max: 0.9,
            power: 1.5,
            griffin_lim_iters: 60,
            griffin_lim_momentum: 0.99,
        }
    }
}

impl AudioConfig {
    /// Number of one-sided STFT bins.
    pub fn fft_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Value used to pad mel targets past the end of an utterance.
    pub fn mel_pad_value(&self) -> f32 {
        if self.symmetric_mels {
            -self.max_abs_value
        } else {
            0.0
        }
    }
}

/// Model dimensions for the Tacotron encoder/decoder/postnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TacotronConfig {
    /// Embedding dimension for the grapheme inputs.
    pub embed_dims: usize,
    pub encoder_dims: usize,
    pub decoder_dims: usize,
    pub postnet_dims: usize,
    /// Widest kernel in the encoder convolution bank.
    pub encoder_k: usize,
    pub lstm_dims: usize,
    /// Widest kernel in the postnet convolution bank.
    pub postnet_k: usize,
    pub num_highways: usize,
    pub dropout: f32,
    pub speaker_embedding_size: usize,
    pub num_mels: usize,
    /// Width of the frame projection; every schedule `r` must be `<= max_r`.
    pub max_r: usize,
    pub attention_filters: usize,
    pub attention_kernel: usize,
    pub zoneout: f32,
    /// Value below which audio generation ends. For a range of [-4, 4] this
    /// terminates the sequence at the first step whose frames are all < -3.4.
    pub stop_threshold: f32,
    pub cleaner_names: Vec<String>,
}

impl Default for TacotronConfig {
    fn default() -> Self {
        Self {
            embed_dims: 512,
            encoder_dims: 128,
            decoder_dims: 256,
            postnet_dims: 128,
            encoder_k: 16,
            lstm_dims: 1024,
            postnet_k: 8,
            num_highways: 4,
            dropout: 0.5,
            speaker_embedding_size: 256,
            num_mels: 80,
            max_r: 20,
            attention_filters: 32,
            attention_kernel: 31,
            zoneout: 0.1,
            stop_threshold: -3.4,
            cleaner_names: vec!["english_cleaners".to_string()],
        }
    }
}

impl TacotronConfig {
    /// Width of one encoder output vector: bidirectional GRU + speaker embedding.
    pub fn encoder_output_dims(&self) -> usize {
        2 * self.encoder_dims + self.speaker_embedding_size
    }

    /// Output width of the decoder pre-net.
    pub fn decoder_prenet_dims(&self) -> usize {
        self.decoder_dims / 2
    }
}

/// One stage of the progressive training schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Reduction factor (frames per decoder step).
    pub r: usize,
    pub lr: f64,
    /// Global step at which this stage ends (exclusive).
    pub max_step: u64,
    pub batch_size: usize,
}

impl ScheduleEntry {
    pub const fn new(r: usize, lr: f64, max_step: u64, batch_size: usize) -> Self {
        Self {
            r,
            lr,
            max_step,
            batch_size,
        }
    }
}

/// Training-loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Progressive training schedule, `(r, lr, step, batch_size)`.
    pub schedule: Vec<ScheduleEntry>,
    /// Global gradient-norm ceiling; `None` disables clipping.
    pub clip_grad_norm: Option<f64>,
    /// `N > 0`: evaluate every N steps. `0`: every epoch. `< 0`: never.
    pub eval_interval: i64,
    pub eval_num_samples: usize,
    pub max_mel_frames: usize,
    /// Parallel devices each batch is split across.
    pub num_devices: usize,
    /// Seed for per-epoch shuffling.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            schedule: vec![
                ScheduleEntry::new(7, 1e-3, 20_000, 16),
                ScheduleEntry::new(6, 3e-4, 50_000, 16),
                ScheduleEntry::new(5, 3e-4, 100_000, 10),
                ScheduleEntry::new(4, 3e-4, 200_000, 8),
                ScheduleEntry::new(3, 3e-4, 300_000, 6),
                ScheduleEntry::new(2, 3e-4, 500_000, 6),
            ],
            clip_grad_norm: Some(1.0),
            eval_interval: 2000,
            eval_num_samples: 1,
            max_mel_frames: 900,
            num_devices: 1,
            seed: 0,
        }
    }
}

/// Generation-time parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Safety bound on emitted frames; generated length never exceeds it.
    pub max_generation_frames: usize,
    /// The stop criterion is only consulted once more than this many frames exist.
    pub min_frames_before_stop: usize,
    /// Keep pre-net dropout active at inference (Tacotron's variation trick).
    /// Disable for reproducible output.
    pub prenet_dropout: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_generation_frames: 2000,
            min_frames_before_stop: 10,
            prenet_dropout: true,
        }
    }
}

/// All hyper-parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub audio: AudioConfig,
    pub tacotron: TacotronConfig,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
}

impl HParams {
    /// Load a (partial) JSON override on top of the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let hparams: Self = serde_json::from_str(&text)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Check the invariants the training loop and model rely on.
    pub fn validate(&self) -> Result<()> {
        let taco = &self.tacotron;
        if taco.num_mels != self.audio.num_mels {
            return Err(Error::Config(format!(
                "tacotron.num_mels ({}) must equal audio.num_mels ({})",
                taco.num_mels, self.audio.num_mels
            )));
        }
        if taco.encoder_k == 0 || taco.postnet_k == 0 {
            return Err(Error::Config("convolution bank width must be >= 1".into()));
        }
        if taco.attention_kernel % 2 == 0 {
            return Err(Error::Config(format!(
                "attention_kernel must be odd, got {}",
                taco.attention_kernel
            )));
        }
        if taco.attention_filters == 0 {
            return Err(Error::Config("attention_filters must be >= 1".into()));
        }
        if self.training.num_devices == 0 {
            return Err(Error::Config("num_devices must be >= 1".into()));
        }
        if self.training.schedule.is_empty() {
            return Err(Error::Config("training schedule is empty".into()));
        }

        let mut previous: Option<u64> = None;
        for (i, entry) in self.training.schedule.iter().enumerate() {
            if entry.r == 0 || entry.r > taco.max_r {
                return Err(Error::Config(format!(
                    "schedule[{i}]: r={} outside 1..={}",
                    entry.r, taco.max_r
                )));
            }
            if entry.lr.is_nan() || entry.lr <= 0.0 {
                return Err(Error::Config(format!("schedule[{i}]: lr must be > 0")));
            }
            if entry.batch_size == 0 || entry.batch_size % self.training.num_devices != 0 {
                return Err(Error::Config(format!(
                    "schedule[{i}]: batch_size {} must be evenly divisible by {} device(s)",
                    entry.batch_size, self.training.num_devices
                )));
            }
            if let Some(prev) = previous
                && entry.max_step <= prev
            {
                return Err(Error::Config(format!(
                    "schedule[{i}]: step threshold {} must exceed previous {prev}",
                    entry.max_step
                )));
            }
            previous = Some(entry.max_step);
        }
        Ok(())
    }
}
