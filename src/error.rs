//! Error types for waveflow-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected when the model is built.
    #[error("config: {0}")]
    Config(String),

    /// Input tensors violate a call-time requirement (shape, length).
    #[error("precondition: {0}")]
    Precondition(String),

    /// Audio processing error (WAV I/O, mel extraction).
    #[error("audio: {0}")]
    Audio(String),

    /// Parameter checkpoint error.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

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
