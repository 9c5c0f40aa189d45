//! Error types for tacotron-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Empty or malformed symbol sequence, rejected before the encoder.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Declared and stored lengths disagree for an example at batch construction.
    #[error("length mismatch for '{id}': {what} (expected {expected}, got {actual})")]
    LengthMismatch {
        id: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// NaN/Inf in the loss or the gradients of a training step.
    #[error("non-finite {what} at step {step}")]
    NonFinite { step: usize, what: &'static str },

    /// Missing, corrupt or incompatible checkpoint.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Preprocessed feature cache problem (missing index, bad line).
    #[error("dataset: {0}")]
    Dataset(String),

    /// Audio processing error (STFT, WAV I/O, sample rate).
    #[error("audio: {0}")]
    Audio(String),

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
