//! WAV file I/O for 16 kHz mono speech.

use std::path::Path;

use crate::config::AudioConfig;
use crate::{Error, Result};

/// Read a WAV file as mono f32 in [-1, 1], return (samples, sample_rate).
///
/// Multi-channel input is averaged down to one channel.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let mono = if channels == 1 {
        samples
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

/// Write mono samples as 16-bit PCM, peak-scaled to full range.
///
/// Quiet signals are not boosted past a 0.01 peak.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    let scale = 32767.0 / peak.max(0.01);

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        let v = (s * scale).round().clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(v)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Peak-normalize audio samples to `[-target, target]`.
pub fn peak_normalize(samples: &mut [f32], target: f32) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = target / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

/// Load a WAV for feature extraction: mono, at the configured rate, and
/// rescaled to `rescaling_max` when enabled.
pub fn load_preprocess_wav(path: impl AsRef<Path>, config: &AudioConfig) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let (mut samples, sample_rate) = read_wav_mono(path)?;
    if sample_rate != config.sample_rate {
        return Err(Error::Audio(format!(
            "{}: sample rate {sample_rate} Hz, expected {} Hz",
            path.display(),
            config.sample_rate
        )));
    }
    if config.rescale {
        peak_normalize(&mut samples, config.rescaling_max);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_normalize() {
        let mut samples = vec![0.5, -0.25, 0.1];
        peak_normalize(&mut samples, 1.0);
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!((samples[1] - (-0.5)).abs() < 1e-6);
    }

    #[test]
    fn written_wav_is_peak_scaled_pcm16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav(&path, &[0.0, 0.25, -0.5], 16000).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.spec().channels, 1);
        let raw: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(raw, vec![0, 16384, -32767]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.5f32, 0.1, -0.2, -0.4] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let (mono, sr) = read_wav_mono(&path).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn preprocess_rejects_wrong_rate_and_rescales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, &[0.1, -0.2, 0.05], 22050).unwrap();
        let cfg = AudioConfig::default();
        assert!(matches!(
            load_preprocess_wav(&path, &cfg),
            Err(Error::Audio(_))
        ));

        write_wav(&path, &[0.1, -0.2, 0.05], 16000).unwrap();
        let wav = load_preprocess_wav(&path, &cfg).unwrap();
        let peak = wav.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        assert!((peak - 0.9).abs() < 1e-3);
    }
}
