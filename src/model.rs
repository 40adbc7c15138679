//! Tacotron synthesizer network.
//!
//! ## Components
//!
//! - [`layers`] — pre-net, batch-norm conv, highway, GRU/LSTM cells
//! - [`cbhg`] — convolution bank + highway + bidirectional GRU
//! - [`encoder`] — text encoder with speaker conditioning
//! - [`attention`] — location-sensitive attention
//! - [`decoder`] — stepwise decoder, frame sources and the run driver
//! - [`tacotron`] — full model, generation and loss

pub mod attention;
pub mod cbhg;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod tacotron;

pub use decoder::{StopReason, run_decoder};
pub use tacotron::{GenerateOptions, Generated, Tacotron, TacotronOutput};
