//! Error types for tacotron-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Audio processing error (STFT, Griffin-Lim, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Rejected caller input (empty text, wrong embedding size, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Malformed dataset manifest or sample files.
    #[error("dataset: {0}")]
    Dataset(String),

    /// Checkpoint present but unreadable or inconsistent with the model.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
