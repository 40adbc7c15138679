//! Mel spectrogram analysis and Griffin-Lim synthesis.
//!
//! Matches the synthesizer's training features:
//! - Sample rate: 16000 Hz, FFT size 800 (401 bins), Hann window 800, hop 200
//! - Pre-emphasis 0.97 before analysis, undone after synthesis
//! - 80 Slaney-normalized mel bins from 55 Hz
//! - `20·log10(max(1e-5, mel)) - ref_level_db`, then symmetric normalization
//!   to `[-max_abs_value, max_abs_value]`
//!
//! The inverse undoes the normalization and hands the log-amplitude mel to
//! the `griffin_lim` vocoder, which shares this module's filterbank.

use griffin_lim::GriffinLim;
use ndarray::Array2;

use crate::audio::stft::Stft;
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Mel spectrogram processor.
///
/// Pre-computes the STFT plan, the mel filterbank and the Griffin-Lim
/// vocoder on construction.
pub struct AudioProcessor {
    config: AudioConfig,
    stft: Stft,
    /// `[n_mels, n_bins]`
    mel_basis: Array2<f32>,
    vocoder: GriffinLim,
}

impl AudioProcessor {
    pub fn new(config: AudioConfig) -> Result<Self> {
        if config.win_length > config.n_fft
            || config.hop_length == 0
            || config.hop_length >= config.n_fft
        {
            return Err(Error::Config(format!(
                "invalid STFT geometry: n_fft={}, win={}, hop={}",
                config.n_fft, config.win_length, config.hop_length
            )));
        }
        let stft = Stft::new(config.n_fft, config.hop_length, config.win_length);
        let mel_basis = mel_filterbank(
            config.n_fft,
            config.num_mels,
            config.sample_rate,
            config.fmin,
            config.fmax,
        );
        let vocoder = GriffinLim::new(
            mel_basis.clone(),
            config.n_fft - config.hop_length,
            config.power,
            config.griffin_lim_iters,
            config.griffin_lim_momentum,
        )
        .map_err(|e| Error::Config(format!("griffin-lim: {e}")))?;

        Ok(Self {
            config,
            stft,
            mel_basis,
            vocoder,
        })
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Compute a normalized log-mel spectrogram `[n_mels][frames]`.
    pub fn melspectrogram(&self, wav: &[f32]) -> Vec<Vec<f32>> {
        let emphasized = self.preemphasis(wav);
        let spectrum = self.stft.forward(&emphasized);
        let shape = (self.stft.num_bins(), spectrum.len());
        let magnitudes = Array2::from_shape_fn(shape, |(k, t)| spectrum[t][k].norm());

        self.mel_basis
            .dot(&magnitudes)
            .mapv(|energy| {
                let db = self.amp_to_db(energy) - self.config.ref_level_db;
                if self.config.signal_normalization {
                    self.normalize(db)
                } else {
                    db
                }
            })
            .outer_iter()
            .map(|row| row.to_vec())
            .collect()
    }

    /// Invert a normalized log-mel spectrogram `[n_mels][frames]` to audio.
    pub fn inv_mel_spectrogram(&self, mel: &[Vec<f32>]) -> Result<Vec<f32>> {
        if mel.len() != self.config.num_mels {
            return Err(Error::Audio(format!(
                "expected {} mel channels, got {}",
                self.config.num_mels,
                mel.len()
            )));
        }
        let num_frames = mel[0].len();
        if mel.iter().any(|row| row.len() != num_frames) {
            return Err(Error::Audio("ragged mel spectrogram".into()));
        }
        if num_frames == 0 {
            return Ok(Vec::new());
        }

        // Natural log of the mel amplitudes, the vocoder's input domain.
        let log_mel = Array2::from_shape_fn((self.config.num_mels, num_frames), |(m, t)| {
            let db = if self.config.signal_normalization {
                self.denormalize(mel[m][t])
            } else {
                mel[m][t]
            };
            (db + self.config.ref_level_db) * std::f32::consts::LN_10 / 20.0
        });

        let wav = self
            .vocoder
            .infer(&log_mel)
            .map_err(|e| Error::Audio(format!("griffin-lim: {e}")))?;
        Ok(self.inv_preemphasis(&wav.to_vec()))
    }

    /// `y[n] = x[n] - k·x[n-1]`
    pub fn preemphasis(&self, wav: &[f32]) -> Vec<f32> {
        if !self.config.preemphasize {
            return wav.to_vec();
        }
        let k = self.config.preemphasis;
        let mut prev = 0.0f32;
        wav.iter()
            .map(|&x| {
                let y = x - k * prev;
                prev = x;
                y
            })
            .collect()
    }

    /// `y[n] = x[n] + k·y[n-1]`
    pub fn inv_preemphasis(&self, wav: &[f32]) -> Vec<f32> {
        if !self.config.preemphasize {
            return wav.to_vec();
        }
        let k = self.config.preemphasis;
        let mut prev = 0.0f32;
        wav.iter()
            .map(|&x| {
                prev = x + k * prev;
                prev
            })
            .collect()
    }

    fn amp_to_db(&self, x: f32) -> f32 {
        let min_level = 10f32.powf(self.config.min_level_db / 20.0);
        20.0 * x.max(min_level).log10()
    }

    fn normalize(&self, s: f32) -> f32 {
        let cfg = &self.config;
        let ratio = (s - cfg.min_level_db) / -cfg.min_level_db;
        let (value, lo) = if cfg.symmetric_mels {
            (2.0 * cfg.max_abs_value * ratio - cfg.max_abs_value, -cfg.max_abs_value)
        } else {
            (cfg.max_abs_value * ratio, 0.0)
        };
        if cfg.allow_clipping_in_normalization {
            value.clamp(lo, cfg.max_abs_value)
        } else {
            value
        }
    }

    fn denormalize(&self, d: f32) -> f32 {
        let cfg = &self.config;
        let d = if cfg.allow_clipping_in_normalization {
            let lo = if cfg.symmetric_mels {
                -cfg.max_abs_value
            } else {
                0.0
            };
            d.clamp(lo, cfg.max_abs_value)
        } else {
            d
        };
        if cfg.symmetric_mels {
            (d + cfg.max_abs_value) * -cfg.min_level_db / (2.0 * cfg.max_abs_value)
                + cfg.min_level_db
        } else {
            d * -cfg.min_level_db / cfg.max_abs_value + cfg.min_level_db
        }
    }
}

fn db_to_amp(x: f32) -> f32 {
    10f32.powf(x * 0.05)
}

/// Build a Slaney-normalized mel filterbank, `[n_mels, n_fft/2 + 1]`.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Array2<f32> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..num_bins).map(|i| sr * i as f64 / n_fft as f64).collect();

    Array2::from_shape_fn((n_mels, num_bins), |(i, k)| {
        let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        let norm = 2.0 / (f_right - f_left);
        let f = bin_freqs[k];
        let w = if f < f_left || f > f_right {
            0.0
        } else if f <= f_center {
            norm * (f - f_left) / (f_center - f_left)
        } else {
            norm * (f_right - f) / (f_right - f_center)
        };
        w as f32
    })
}

/// Below 1000 Hz: linear (`3f/200`). Above: logarithmic.
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> AudioProcessor {
        AudioProcessor::new(AudioConfig::default()).unwrap()
    }

    #[test]
    fn mel_conversion_roundtrip() {
        for &freq in &[55.0, 440.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(freq));
            assert!((freq - back).abs() < 0.01, "{freq} Hz came back as {back}");
        }
    }

    #[test]
    fn filterbank_shape_and_sign() {
        let fb = mel_filterbank(800, 80, 16000, 55.0, 8000.0);
        assert_eq!(fb.dim(), (80, 401));
        assert!(fb.iter().all(|&w| w >= 0.0));
        assert!(fb.outer_iter().all(|f| f.sum() > 0.0));
    }

    #[test]
    fn melspectrogram_shape_and_range() {
        let ap = processor();
        let wav: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        let mel = ap.melspectrogram(&wav);
        assert_eq!(mel.len(), 80);
        assert_eq!(mel[0].len(), 81);
        assert!(mel.iter().flatten().all(|v| (-4.0..=4.0).contains(v)));
    }

    #[test]
    fn silence_maps_to_floor() {
        let ap = processor();
        let mel = ap.melspectrogram(&vec![0.0; 4000]);
        assert!(mel.iter().flatten().all(|&v| (v + 4.0).abs() < 1e-5));
    }

    #[test]
    fn normalization_inverts_inside_range() {
        let ap = processor();
        for db in [-90.0f32, -50.0, -10.0] {
            let back = ap.denormalize(ap.normalize(db));
            assert!((back - db).abs() < 1e-3, "{db} -> {back}");
        }
    }

    #[test]
    fn preemphasis_is_invertible() {
        let ap = processor();
        let wav = vec![0.1, -0.2, 0.3, 0.05, -0.4];
        let back = ap.inv_preemphasis(&ap.preemphasis(&wav));
        for (a, b) in wav.iter().zip(&back) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn inverse_produces_hop_aligned_audio() {
        let cfg = AudioConfig {
            griffin_lim_iters: 2,
            ..AudioConfig::default()
        };
        let ap = AudioProcessor::new(cfg).unwrap();
        let mel = vec![vec![-1.0f32; 20]; 80];
        let wav = ap.inv_mel_spectrogram(&mel).unwrap();
        // One hop per frame, give or take the edge windows.
        assert!(wav.len() >= 18 * 200 && wav.len() <= 20 * 200 + 800, "{} samples", wav.len());
        assert!(wav.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn inverse_rejects_wrong_channel_count() {
        let ap = processor();
        assert!(ap.inv_mel_spectrogram(&vec![vec![0.0; 5]; 40]).is_err());
        let ragged: Vec<Vec<f32>> = (0..80).map(|i| vec![0.0; 5 + i % 2]).collect();
        assert!(ap.inv_mel_spectrogram(&ragged).is_err());
    }

    #[test]
    fn hop_not_shorter_than_fft_is_rejected() {
        let cfg = AudioConfig {
            hop_length: 800,
            ..AudioConfig::default()
        };
        assert!(matches!(AudioProcessor::new(cfg), Err(Error::Config(_))));
    }
}
