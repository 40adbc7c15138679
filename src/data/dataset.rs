//! Preprocessed synthesizer dataset.
//!
//! Layout under `syn_dir`:
//!
//! ```text
//! train.txt            wav|mel|embed|n_samples|n_frames|text   (one utterance per line)
//! mels/<mel>.npy       [T, n_mels] f32
//! embeds/<embed>.npy   [256] f32
//! ```

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::text::text_to_sequence;
use crate::{Error, Result};

/// One `train.txt` row.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub wav: String,
    pub mel: String,
    pub embed: String,
    pub n_samples: usize,
    pub n_frames: usize,
    pub text: String,
}

impl MetadataEntry {
    fn parse(line: &str, line_no: usize) -> Result<Self> {
        let fields: Vec<&str> = line.splitn(6, '|').collect();
        let &[wav, mel, embed, n_samples, n_frames, text] = fields.as_slice() else {
            return Err(Error::Dataset(format!(
                "train.txt:{line_no}: expected 6 '|'-separated fields, got {}",
                fields.len()
            )));
        };
        let number = |field: &str, name: &str| {
            field.trim().parse::<usize>().map_err(|e| {
                Error::Dataset(format!("train.txt:{line_no}: bad {name} {field:?}: {e}"))
            })
        };
        Ok(Self {
            wav: wav.to_string(),
            mel: mel.to_string(),
            embed: embed.to_string(),
            n_samples: number(n_samples, "sample count")?,
            n_frames: number(n_frames, "frame count")?,
            text: text.trim().to_string(),
        })
    }
}

/// A loaded training example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub tokens: Vec<u32>,
    /// `[n_mels, T]` on the CPU.
    pub mel: Tensor,
    /// `[speaker_dims]` on the CPU.
    pub embedding: Tensor,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SynthesizerDataset {
    entries: Vec<MetadataEntry>,
    mel_dir: PathBuf,
    embed_dir: PathBuf,
    cleaner_names: Vec<String>,
    max_mel_frames: usize,
    speaker_dims: usize,
}

impl SynthesizerDataset {
    /// Read `train.txt`; mel and embedding files are loaded per item.
    /// Rows with zero frames are skipped.
    pub fn open(
        syn_dir: impl AsRef<Path>,
        cleaner_names: &[String],
        max_mel_frames: usize,
        speaker_dims: usize,
    ) -> Result<Self> {
        let syn_dir = syn_dir.as_ref();
        let metadata_path = syn_dir.join("train.txt");
        let metadata = std::fs::read_to_string(&metadata_path).map_err(|e| {
            Error::Dataset(format!("cannot read {}: {e}", metadata_path.display()))
        })?;

        let mut entries = Vec::new();
        for (i, line) in metadata.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = MetadataEntry::parse(line, i + 1)?;
            if entry.n_frames > 0 {
                entries.push(entry);
            }
        }
        if entries.is_empty() {
            return Err(Error::Dataset(format!(
                "{} lists no usable utterances",
                metadata_path.display()
            )));
        }
        tracing::info!(
            utterances = entries.len(),
            path = %metadata_path.display(),
            "loaded synthesizer metadata"
        );

        Ok(Self {
            entries,
            mel_dir: syn_dir.join("mels"),
            embed_dir: syn_dir.join("embeds"),
            cleaner_names: cleaner_names.to_vec(),
            max_mel_frames,
            speaker_dims,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Load item `index`: tokens, `[n_mels, T]` mel (truncated to
    /// `max_mel_frames`) and speaker embedding.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or_else(|| {
            Error::Dataset(format!("index {index} out of range ({} items)", self.len()))
        })?;

        let mel_path = self.mel_dir.join(&entry.mel);
        let mel = Tensor::read_npy(&mel_path)
            .map_err(|e| Error::Dataset(format!("{}: {e}", mel_path.display())))?
            .to_dtype(DType::F32)?;
        let (frames, _) = mel.dims2().map_err(|e| {
            Error::Dataset(format!("{}: expected [T, n_mels]: {e}", mel_path.display()))
        })?;
        let mel = mel
            .narrow(0, 0, frames.min(self.max_mel_frames))?
            .t()?
            .contiguous()?;

        let embed_path = self.embed_dir.join(&entry.embed);
        let embedding = Tensor::read_npy(&embed_path)
            .map_err(|e| Error::Dataset(format!("{}: {e}", embed_path.display())))?
            .to_dtype(DType::F32)?
            .flatten_all()?;
        if embedding.dim(0)? != self.speaker_dims {
            return Err(Error::Dataset(format!(
                "{}: embedding has {} values, expected {}",
                embed_path.display(),
                embedding.dim(0)?,
                self.speaker_dims
            )));
        }

        let tokens = text_to_sequence(&entry.text, &self.cleaner_names)
            .map_err(|e| Error::Dataset(format!("{}: {e}", entry.mel)))?;

        Ok(Sample {
            tokens,
            mel,
            embedding,
            text: entry.text.clone(),
        })
    }

    /// Deterministic per-epoch permutation of item indices.
    pub fn shuffled_indices(&self, seed: u64, epoch: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch));
        indices.shuffle(&mut rng);
        indices
    }
}

/// Write one utterance in the dataset layout. Used by tests and tooling that
/// prepares small corpora.
pub fn write_sample(
    syn_dir: impl AsRef<Path>,
    name: &str,
    mel: &Tensor,
    embedding: &Tensor,
) -> Result<()> {
    let syn_dir = syn_dir.as_ref();
    std::fs::create_dir_all(syn_dir.join("mels"))?;
    std::fs::create_dir_all(syn_dir.join("embeds"))?;
    mel.t()?
        .contiguous()?
        .to_device(&Device::Cpu)?
        .write_npy(syn_dir.join("mels").join(format!("mel-{name}.npy")))?;
    embedding
        .to_device(&Device::Cpu)?
        .write_npy(syn_dir.join("embeds").join(format!("embed-{name}.npy")))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a tiny dataset: `(name, frames, text)` per utterance.
    pub(crate) fn make_dataset(dir: &Path, items: &[(&str, usize, &str)], n_mels: usize) {
        let mut lines = String::new();
        for (i, (name, frames, text)) in items.iter().enumerate() {
            if *frames > 0 {
                let value = i as f32 * 0.1 - 1.0;
                let mel = Tensor::full(value, (n_mels, *frames), &Device::Cpu).unwrap();
                let embedding = Tensor::full(0.05f32, 256, &Device::Cpu).unwrap();
                write_sample(dir, name, &mel, &embedding).unwrap();
            }
            lines.push_str(&format!(
                "audio-{name}.npy|mel-{name}.npy|embed-{name}.npy|{}|{frames}|{text}\n",
                frames * 200
            ));
        }
        std::fs::write(dir.join("train.txt"), lines).unwrap();
    }

    fn cleaners() -> Vec<String> {
        vec!["english_cleaners".to_string()]
    }

    #[test]
    fn parses_metadata_and_skips_empty_rows() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(
            dir.path(),
            &[("a", 12, "Hello there."), ("b", 0, "skipped"), ("c", 7, "A|B")],
            80,
        );
        let ds = SynthesizerDataset::open(dir.path(), &cleaners(), 900, 256).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.entries()[1].text, "A|B");

        let sample = ds.get(0).unwrap();
        assert_eq!(sample.mel.dims(), &[80, 12]);
        assert_eq!(sample.embedding.dims(), &[256]);
        assert_eq!(*sample.tokens.last().unwrap(), crate::text::EOS_ID);
    }

    #[test]
    fn long_mels_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[("a", 30, "long one")], 80);
        let ds = SynthesizerDataset::open(dir.path(), &cleaners(), 16, 256).unwrap();
        assert_eq!(ds.get(0).unwrap().mel.dims(), &[80, 16]);
    }

    #[test]
    fn malformed_line_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.txt"), "a|b|c\n").unwrap();
        let err = SynthesizerDataset::open(dir.path(), &cleaners(), 900, 256).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
        assert!(err.to_string().contains("train.txt:1"), "{err}");
    }

    #[test]
    fn shuffle_is_seeded_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<(String, usize, &str)> =
            (0..10).map(|i| (format!("u{i}"), 5, "text")).collect();
        let items: Vec<(&str, usize, &str)> =
            items.iter().map(|(n, f, t)| (n.as_str(), *f, *t)).collect();
        make_dataset(dir.path(), &items, 80);
        let ds = SynthesizerDataset::open(dir.path(), &cleaners(), 900, 256).unwrap();

        let a = ds.shuffled_indices(7, 1);
        assert_eq!(a, ds.shuffled_indices(7, 1));
        assert_ne!(a, ds.shuffled_indices(7, 2));
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}
