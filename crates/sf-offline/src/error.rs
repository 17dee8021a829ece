//! Error types for the offline separation pipeline

use sf_ml::MlError;
use thiserror::Error;

/// Errors from decoding, resampling, separating and writing stems
#[derive(Error, Debug)]
pub enum OfflineError {
    #[error("Input audio not found: {0}")]
    InputNotFound(String),

    #[error("Cannot decode input: {0}")]
    ReadError(String),

    #[error("Cannot write stem: {0}")]
    WriteError(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("Separation job failed: {0}")]
    ProcessingFailed(String),

    #[error("Separation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV encoding failed: {0}")]
    EncodingError(String),

    #[error("Resampling failed: {0}")]
    SampleRateConversion(String),

    #[error("Cannot map {actual} channels to {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Model error: {0}")]
    Ml(#[from] MlError),
}

/// Result type for offline operations
pub type OfflineResult<T> = Result<T, OfflineError>;
