//! Audio front-end and back-end.
//!
//! - [`AudioProcessor`] — log-mel analysis and Griffin-Lim inversion
//! - [`Stft`] — centered STFT on rustfft
//! - WAV read/write at 16 kHz mono

mod mel;
mod stft;
mod wav;

pub use mel::AudioProcessor;
pub use stft::Stft;
pub use wav::{load_preprocess_wav, peak_normalize, read_wav_mono, write_wav};
