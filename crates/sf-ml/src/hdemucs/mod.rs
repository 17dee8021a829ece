//! Hybrid Demucs (v3), implemented natively on `ndarray`
//!
//! The spectral and waveform branches run side by side until the spectral
//! branch is down to a single row. There the waveform branch is injected
//! into the spectral encoder and the deepest levels are shared.
//! Layers come from [`crate::htdemucs::layers`].

pub mod config;
pub mod model;

pub use config::{HDemucsConfig, HybridLevel};
pub use model::HDemucs;
