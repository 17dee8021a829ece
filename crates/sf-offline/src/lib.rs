//! SF-Offline — Offline Stem Separation Pipeline
//!
//! Turns audio files into one file per stem:
//! - Decoding of WAV, FLAC, MP3, OGG, AAC/M4A and AIFF
//! - Channel and sample rate matching for the model
//! - Separation through any `sf_ml` model
//! - Clip handling, two-stem output and file naming templates
//! - Batch (rayon) and async (tokio) execution
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        SeparationPipeline                            │
//! │                                                                      │
//! │  ┌─────────┐   ┌───────────┐   ┌───────────┐   ┌──────┐   ┌───────┐  │
//! │  │ Decoder │ → │ Resampler │ → │ Separator │ → │ Clip │ → │Encoder│  │
//! │  └─────────┘   └───────────┘   └───────────┘   └──────┘   └───────┘  │
//! │                                                                      │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │              BatchProcessor (rayon, shared model)              │  │
//! │  │  [Job1] [Job2] [Job3] ... [JobN] → ThreadPool                  │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sf_offline::{SeparationPipeline, SeparationJob, OfflineConfig, OutputFormat};
//! use sf_ml::{ModelLoader, SeparationConfig};
//!
//! let model = ModelLoader::load("models/htdemucs.safetensors")?;
//! let pipeline = SeparationPipeline::new(model, SeparationConfig::default(), OfflineConfig::default())?;
//!
//! let job = SeparationJob::builder()
//!     .input("/path/to/song.flac")
//!     .output_dir("separated")
//!     .format(OutputFormat::wav_24())
//!     .build()?;
//!
//! let result = pipeline.process_job(&job)?;
//! ```

mod buffer;
mod config;
mod decoder;
mod encoder;
mod error;
mod formats;
mod job;
mod pipeline;
mod resample;

pub use buffer::*;
pub use config::*;
pub use decoder::*;
pub use encoder::*;
pub use error::*;
pub use formats::*;
pub use job::*;
pub use pipeline::*;
pub use resample::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
