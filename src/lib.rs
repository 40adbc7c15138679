//! Speaker-conditioned Tacotron synthesizer in pure Rust.
//!
//! A candle-based implementation of a Tacotron text-to-spectrogram model
//! conditioned on a 256-dimensional speaker embedding, with the progressive
//! training loop and the inference driver.
//!
//! ## Architecture
//!
//! ```text
//! text → cleaners → symbol ids
//!                       ↓
//!      embedding → pre-net → CBHG ──┬→ encoder memory [L, 2·enc + 256]
//! speaker embedding [256] ──────────┘
//!                       ↓
//!      location-sensitive attention + LSTM decoder, r frames per step
//!                       ↓
//!      coarse mel [80, T] → CBHG postnet → refined mel [80, T]
//! ```
//!
//! ## Modules
//!
//! - [`text`] — cleaners and the symbol vocabulary
//! - [`audio`] — mel spectrogram analysis, Griffin-Lim, WAV I/O
//! - [`model`] — encoder, attention, decoder, postnet
//! - [`data`] — preprocessed corpus and batch collation
//! - [`train`] — schedule, optimizer, checkpoints, training loop
//! - [`synthesizer`] — inference from a checkpoint
//! - [`config`] — hyper-parameters

pub mod audio;
pub mod config;
pub mod data;
pub mod model;
pub mod synthesizer;
pub mod text;
pub mod train;

mod error;

pub use error::{Error, Result};
