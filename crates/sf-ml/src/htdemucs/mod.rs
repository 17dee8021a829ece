//! Hybrid Transformer Demucs, implemented natively on `ndarray`
//!
//! The spectral and waveform branches run side by side, meet in a
//! cross-domain transformer, and are summed after their decoders. The
//! encoder / decoder layers and the spectrogram are shared with
//! [`crate::hdemucs`].

pub mod config;
pub mod layers;
pub mod model;
pub mod spec;
pub mod transformer;

pub use config::{HTDemucsConfig, LevelChannels};
pub use layers::{Branch, DConvOptions, LayerGeometry};
pub use model::HTDemucs;
pub use spec::Spectrogram;
