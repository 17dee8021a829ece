//! # StemForge ML
//!
//! Music source separation with the Demucs family, CPU only:
//! - Model loading from safetensors, ONNX and bag manifests
//! - Native HTDemucs v4 and Hybrid Demucs v3 inference (spectral + waveform branches)
//! - Segmented, overlap-added, shift-averaged separation
//!
//! ## Architecture
//!
//! ```text
//!   ModelLoader ──► Arc<dyn SeparationModel> ──► Separator ──► StemCollection
//!        │          HTDemucs / HDemucs / OnnxDemucs / BagOfModels
//!        └─ WeightStore (safetensors)
//! ```
//!
//! Native weights run on `ndarray` with `rayon`; ONNX exports run through
//! `tract`. Both sit behind the same [`separation::SeparationModel`] trait.

// Many internal items don't need docs
#![allow(missing_docs)]

pub mod hdemucs;
pub mod htdemucs;
pub mod loader;
pub mod nn;
pub mod registry;
pub mod separation;
pub mod weights;

mod error;
mod inference;

pub use error::{MlError, MlResult};
pub use hdemucs::{HDemucs, HDemucsConfig};
pub use htdemucs::{HTDemucs, HTDemucsConfig};
pub use inference::{InferenceConfig, InferenceEngine};
pub use loader::{ModelInfo, ModelKind, ModelLoader, NativeConfig};
pub use registry::{find as find_known_model, known_models, Architecture, KnownModel};
pub use separation::{SeparationConfig, SeparationModel, Separator, SourceSeparator, StemCollection, StemType};
pub use weights::{ParamInit, ParamSpec, WeightStore};

/// Default model locations, relative to the working directory
pub mod models {
    /// Directory searched for model files
    pub const MODEL_DIR: &str = "models";

    /// HTDemucs v4, 4 stems
    pub const HTDEMUCS: &str = "models/htdemucs.safetensors";

    /// HTDemucs v4, 6 stems
    pub const HTDEMUCS_6S: &str = "models/htdemucs_6s.safetensors";

    /// Fine-tuned bag manifest
    pub const HTDEMUCS_FT: &str = "models/htdemucs_ft.json";

    /// Hybrid Demucs v3, 4 stems
    pub const HDEMUCS_MMI: &str = "models/hdemucs_mmi.safetensors";
}

/// Sample rates used by the Demucs family
pub mod sample_rates {
    /// All published HTDemucs checkpoints
    pub const HTDEMUCS: u32 = 44100;

    /// Published Hybrid Demucs v3 checkpoints
    pub const HDEMUCS: u32 = 44100;
}
