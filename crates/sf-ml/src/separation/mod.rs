//! Audio source separation (stem separation)
//!
//! Music source separation with the Demucs family:
//! - 4 stems: drums, bass, other, vocals (htdemucs)
//! - 6 stems: + guitar, piano (htdemucs_6s)
//! - bags of fine-tuned models averaged per source (htdemucs_ft)
//! - 2 stems: vocals / no_vocals
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sf_ml::{ModelLoader, separation::{Separator, SeparationConfig, StemType}};
//!
//! let model = ModelLoader::load("models/htdemucs.safetensors")?;
//! let separator = Separator::new(model, SeparationConfig::high_quality())?;
//! let stems = separator.separate(&audio, 2, 44100)?;
//!
//! let vocals = stems.get(StemType::Vocals).unwrap();
//! let karaoke = stems.karaoke(); // everything except vocals
//! ```

mod apply;
mod bag;
mod config;
mod onnx;
mod separator;
mod stems;

pub use apply::{apply_model, apply_model_with_report, ApplyOptions, ApplyReport, ProgressCallback, TensorChunk};
pub use bag::{BagManifest, BagOfModels};
pub use config::{SeparationConfig, SeparationQuality};
pub use onnx::OnnxDemucs;
pub use separator::{convert_channels, Separator};
pub use stems::{SeparationStats, StemCollection, StemMetrics, StemOutput, StemType};

use ndarray::{Array3, ArrayView2};

use crate::error::{MlError, MlResult};

/// A network mapping a fixed-rate planar mix to per-source waveforms.
///
/// Models are immutable once loaded and shared across threads.
pub trait SeparationModel: Send + Sync {
    /// Model name/version
    fn name(&self) -> &str;

    /// Sources in output order
    fn sources(&self) -> &[StemType];

    /// Sample rate the model was trained at
    fn samplerate(&self) -> u32;

    fn audio_channels(&self) -> usize;

    /// Samples per evaluation (the training segment)
    fn segment_length(&self) -> usize;

    /// `[C, L]` with `L <= segment_length()` into `[S, C, L]`
    fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>>;

    /// Input length the model must be fed for `length` useful samples
    fn valid_length(&self, length: usize) -> MlResult<usize> {
        let segment = self.segment_length();
        if length > segment {
            return Err(MlError::InvalidInputShape {
                expected: format!("at most {segment} samples per evaluation"),
                got: length.to_string(),
            });
        }
        Ok(segment)
    }

    fn parameter_count(&self) -> usize {
        0
    }

    /// Members and weights when this model is an ensemble
    fn as_bag(&self) -> Option<&BagOfModels> {
        None
    }
}

/// Common trait for source separators
pub trait SourceSeparator: Send + Sync {
    /// Separate interleaved audio into stems
    ///
    /// # Arguments
    /// * `audio` - Interleaved audio samples
    /// * `channels` - Number of audio channels
    /// * `sample_rate` - Sample rate in Hz, must match the model
    fn separate(&self, audio: &[f32], channels: usize, sample_rate: u32) -> MlResult<StemCollection>;

    /// Stem types produced, in model order
    fn available_stems(&self) -> &[StemType];

    /// Model name/version
    fn model_name(&self) -> &str;

    /// Estimate memory usage for given audio duration
    fn estimated_memory_mb(&self, duration_secs: f32) -> f32;
}
