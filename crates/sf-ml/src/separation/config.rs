//! Separation configuration

use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};

/// Separation quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeparationQuality {
    /// Single pass, no overlap
    Fast,
    /// Published inference defaults
    #[default]
    Default,
    /// Shift averaging on top of the defaults
    High,
    /// Heavy shift averaging and wide overlap
    Ultra,
}

/// Separation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Quality preset
    pub quality: SeparationQuality,

    /// Segment length in seconds, `None` uses the model's training segment.
    /// Longer than the training segment is rejected by transformer models.
    pub segment: Option<f32>,

    /// Overlap between consecutive segments (0.0 - 0.95)
    pub overlap: f32,

    /// Random shift passes (0 disables the shift trick)
    pub shifts: usize,

    /// Exponent applied to the triangular overlap window
    pub transition_power: f32,

    /// Split long inputs into segments (disable only for short clips)
    pub split: bool,

    /// Segments evaluated in parallel (0 = run inline on the caller thread)
    pub num_workers: usize,

    /// Seed for the shift offsets
    pub seed: u64,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            quality: SeparationQuality::Default,
            segment: None,
            overlap: 0.25,
            shifts: 1,
            transition_power: 1.0,
            split: true,
            num_workers: 0,
            seed: 0,
        }
    }
}

impl SeparationConfig {
    /// Create fast configuration
    pub fn fast() -> Self {
        Self {
            quality: SeparationQuality::Fast,
            overlap: 0.1,
            shifts: 0,
            num_workers: num_cpus::get(),
            ..Self::default()
        }
    }

    /// Create high quality configuration
    pub fn high_quality() -> Self {
        Self {
            quality: SeparationQuality::High,
            overlap: 0.25,
            shifts: 2,
            num_workers: num_cpus::get(),
            ..Self::default()
        }
    }

    /// Create ultra quality configuration
    pub fn ultra() -> Self {
        Self {
            quality: SeparationQuality::Ultra,
            overlap: 0.5,
            shifts: 5,
            num_workers: num_cpus::get(),
            ..Self::default()
        }
    }

    pub fn with_segment(mut self, seconds: f32) -> Self {
        self.segment = Some(seconds);
        self
    }

    pub fn with_overlap(mut self, overlap: f32) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_shifts(mut self, shifts: usize) -> Self {
        self.shifts = shifts;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> MlResult<()> {
        if !(0.0..0.95).contains(&self.overlap) {
            return Err(MlError::InvalidConfig(format!(
                "overlap must be in [0, 0.95), got {}",
                self.overlap
            )));
        }
        if self.transition_power < 1.0 {
            return Err(MlError::InvalidConfig(format!(
                "transition_power must be >= 1, got {}",
                self.transition_power
            )));
        }
        if let Some(segment) = self.segment {
            if !(segment.is_finite() && segment > 0.0) {
                return Err(MlError::InvalidConfig(format!("invalid segment length {segment}")));
            }
        }
        Ok(())
    }

    /// Model evaluations per second of audio, relative to one plain pass
    pub fn passes_per_segment(&self) -> f32 {
        let overlap_factor = 1.0 / (1.0 - self.overlap);
        overlap_factor * self.shifts.max(1) as f32
    }

    /// Estimate processing time factor (relative to real-time)
    pub fn estimated_rtf(&self) -> f32 {
        // one CPU pass of htdemucs runs at roughly 0.25x real time
        let base_rtf = 0.25;
        let parallel = if self.num_workers > 1 {
            1.0 / (self.num_workers as f32).sqrt()
        } else {
            1.0
        };
        base_rtf * self.passes_per_segment() * parallel
    }

    /// Estimate memory usage in MB
    pub fn estimated_memory_mb(&self, duration_secs: f32, sample_rate: u32, num_sources: usize) -> f32 {
        let samples = duration_secs * sample_rate as f32;
        let channels = 2.0;

        // input, output accumulators, weights
        let base_mb = samples * channels * (2.0 + num_sources as f32) * 4.0 / 1_000_000.0;

        // activations per in-flight segment
        let segment_secs = self.segment.unwrap_or(7.8);
        let segment_mb = segment_secs * sample_rate as f32 * channels * 4.0 / 1_000_000.0;
        let in_flight = self.num_workers.max(1) as f32;

        let model_mb = 170.0;

        base_mb + segment_mb * 60.0 * in_flight + model_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        let fast = SeparationConfig::fast().with_workers(1);
        let ultra = SeparationConfig::ultra().with_workers(1);

        assert!(fast.estimated_rtf() < ultra.estimated_rtf());
        assert_eq!(fast.shifts, 0);
        assert!(ultra.validate().is_ok());
        assert_eq!(SeparationConfig::default().overlap, 0.25);
    }

    #[test]
    fn test_validation() {
        assert!(SeparationConfig::default().with_overlap(0.95).validate().is_err());
        assert!(SeparationConfig::default().with_segment(0.0).validate().is_err());
        let config = SeparationConfig {
            transition_power: 0.5,
            ..SeparationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_estimation() {
        let config = SeparationConfig::default();
        let mem = config.estimated_memory_mb(180.0, 44100, 4);

        assert!(mem < 2000.0);
        assert!(mem > 100.0);
    }

    #[test]
    fn test_json_partial() {
        let config: SeparationConfig = serde_json::from_str(r#"{"shifts": 3, "quality": "high"}"#).unwrap();
        assert_eq!(config.shifts, 3);
        assert_eq!(config.quality, SeparationQuality::High);
        assert_eq!(config.overlap, 0.25);
    }
}
