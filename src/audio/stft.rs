//! Short-time Fourier transform for feature extraction.
//!
//! Conventions follow librosa with `center=True`: the signal is reflect-padded
//! by `n_fft / 2` on both sides and the analysis window is a periodic Hann of
//! `win_length` zero-padded to `n_fft`.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

/// Planned forward FFT plus the analysis window.
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize, win_length: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n_fft);

        // Hann window centered in an n_fft frame.
        let win_length = win_length.min(n_fft);
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for (i, w) in hann_window(win_length).into_iter().enumerate() {
            window[offset + i] = w;
        }

        Self {
            n_fft,
            hop_length,
            window,
            forward,
        }
    }

    /// Number of one-sided frequency bins.
    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Centered STFT. Returns one `num_bins()`-long spectrum per frame.
    pub fn forward(&self, signal: &[f32]) -> Vec<Vec<Complex32>> {
        if signal.is_empty() {
            return Vec::new();
        }
        let pad = self.n_fft / 2;
        let padded = reflect_pad(signal, pad, pad);
        let num_frames = 1 + (padded.len() - self.n_fft) / self.hop_length;
        let num_bins = self.num_bins();

        let mut frames = Vec::with_capacity(num_frames);
        let mut buffer = vec![Complex32::new(0.0, 0.0); self.n_fft];
        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop_length;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex32::new(padded[start + i] * self.window[i], 0.0);
            }
            self.forward.process(&mut buffer);
            frames.push(buffer[..num_bins].to_vec());
        }
        frames
    }
}

/// Periodic Hann window (matches `scipy.signal.get_window("hann", n)`).
pub(crate) fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            (0.5 * (1.0 - phase.cos())) as f32
        })
        .collect()
}

/// Reflect-pad a signal on both sides (edge sample not repeated).
fn reflect_pad(signal: &[f32], pad_left: usize, pad_right: usize) -> Vec<f32> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);

    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}
