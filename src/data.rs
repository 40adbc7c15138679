//! Training data: the preprocessed synthesizer corpus and batch collation.

mod collate;
mod dataset;

pub use collate::{Batch, collate, padded_frames};
pub use dataset::{MetadataEntry, Sample, SynthesizerDataset, write_sample};

#[cfg(test)]
pub(crate) use dataset::tests::make_dataset;
