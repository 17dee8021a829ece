//! Configuration types for offline separation

use serde::{Deserialize, Serialize};

use crate::error::{OfflineError, OfflineResult};

/// Offline pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum jobs running at once in a batch (0 = one per core)
    pub max_concurrent_jobs: usize,

    /// Sample rate conversion quality for the model input
    pub src_quality: SrcQuality,

    /// Resample stems back to the input file's rate
    pub keep_input_rate: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            src_quality: SrcQuality::default(),
            keep_input_rate: false,
        }
    }
}

impl OfflineConfig {
    /// Create config for maximum quality (slower)
    pub fn quality() -> Self {
        Self {
            src_quality: SrcQuality::Best,
            ..Default::default()
        }
    }

    /// Create config for maximum speed
    pub fn fast() -> Self {
        Self {
            src_quality: SrcQuality::Quick,
            max_concurrent_jobs: 0,
            ..Default::default()
        }
    }

    /// Set concurrent job limit
    pub fn with_concurrent_jobs(mut self, count: usize) -> Self {
        self.max_concurrent_jobs = count;
        self
    }

    pub fn with_src_quality(mut self, quality: SrcQuality) -> Self {
        self.src_quality = quality;
        self
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> OfflineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| OfflineError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Dithering algorithm for bit depth reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitheringMode {
    /// No dithering (truncation)
    None,
    /// Rectangular PDF dither
    Rectangular,
    /// Triangular PDF dither (recommended)
    Triangular,
}

impl Default for DitheringMode {
    fn default() -> Self {
        Self::Triangular
    }
}

/// Sample rate conversion quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrcQuality {
    /// Fast, lower quality
    Quick,
    /// Medium quality
    Medium,
    /// Best quality (slower)
    Best,
}

impl Default for SrcQuality {
    fn default() -> Self {
        Self::Medium
    }
}

impl SrcQuality {
    /// FFT resampler input chunk and sub-chunk count
    pub(crate) fn fft_params(self) -> (usize, usize) {
        match self {
            Self::Quick => (1024, 1),
            Self::Medium => (2048, 2),
            Self::Best => (4096, 4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(OfflineConfig::quality().src_quality, SrcQuality::Best);
        assert_eq!(OfflineConfig::fast().max_concurrent_jobs, 0);
        assert!(!OfflineConfig::default().keep_input_rate);
    }

    #[test]
    fn test_partial_json() {
        let config: OfflineConfig = serde_json::from_str(r#"{"src_quality": "best"}"#).unwrap();
        assert_eq!(config.src_quality, SrcQuality::Best);
        assert_eq!(config.max_concurrent_jobs, 1);
    }
}
