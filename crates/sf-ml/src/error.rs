//! Error types for model loading and inference

use thiserror::Error;

/// ML processing error types
#[derive(Error, Debug)]
pub enum MlError {
    /// Model file not found
    #[error("Model not found: {path}")]
    ModelNotFound { path: String },

    /// Model loading failed
    #[error("Failed to load model: {reason}")]
    ModelLoadFailed { reason: String },

    /// A parameter the architecture needs is absent from the weight file
    #[error("Missing tensor: {name}")]
    MissingTensor { name: String },

    /// A parameter exists but with the wrong shape
    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Tensor stored in a dtype we cannot convert to f32
    #[error("Unsupported dtype for {name}: {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    /// Architecture or runtime configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inference failed
    #[error("Inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// Invalid input shape
    #[error("Invalid input shape: expected {expected}, got {got}")]
    InvalidInputShape { expected: String, got: String },

    /// Invalid output shape
    #[error("Invalid output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    /// Invalid sample rate
    #[error("Invalid sample rate: expected {expected}, got {got}")]
    InvalidSampleRate { expected: u32, got: u32 },

    /// Channel count mismatch
    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Processing failed
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    /// Separation was cancelled between segments
    #[error("Separation cancelled")]
    Cancelled,

    /// Tract error
    #[error("Tract error: {0}")]
    TractError(String),

    /// Safetensors parse error
    #[error("Safetensors error: {0}")]
    Safetensors(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error (config sidecars, bag manifests)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<safetensors::SafeTensorError> for MlError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        MlError::Safetensors(e.to_string())
    }
}

/// Result type for ML operations
pub type MlResult<T> = Result<T, MlError>;
