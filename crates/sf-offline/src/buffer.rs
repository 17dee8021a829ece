//! Interleaved audio buffer shared by the decoder, resampler and encoders

use crate::error::{OfflineError, OfflineResult};

/// Interleaved f32 audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved samples
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: usize,
    /// Sample rate
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create new buffer
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            channels,
            sample_rate,
        }
    }

    /// Build from per-channel data; all channels must have the same length
    pub fn from_planar(planes: &[Vec<f32>], sample_rate: u32) -> OfflineResult<Self> {
        let channels = planes.len();
        let frames = planes.first().map_or(0, Vec::len);
        if let Some(bad) = planes.iter().find(|p| p.len() != frames) {
            return Err(OfflineError::ProcessingFailed(format!(
                "planar channels differ in length ({frames} vs {})",
                bad.len()
            )));
        }

        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            samples.extend(planes.iter().map(|p| p[i]));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Number of frames
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Get channel slice (non-interleaved copy)
    pub fn channel(&self, channel: usize) -> Vec<f32> {
        if channel >= self.channels {
            return Vec::new();
        }
        self.samples
            .iter()
            .skip(channel)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// De-interleave into one vector per channel
    pub fn to_planar(&self) -> Vec<Vec<f32>> {
        (0..self.channels).map(|c| self.channel(c)).collect()
    }

    /// Convert to mono (mixdown)
    pub fn to_mono(&self) -> AudioBuffer {
        if self.channels <= 1 {
            return self.clone();
        }

        let mono = self
            .samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect();

        AudioBuffer {
            samples: mono,
            channels: 1,
            sample_rate: self.sample_rate,
        }
    }

    /// Adapt to `target` channels: mono is duplicated, a mono target mixes
    /// down, extra channels are dropped
    pub fn with_channels(&self, target: usize) -> OfflineResult<AudioBuffer> {
        if target == 0 || self.channels == 0 {
            return Err(OfflineError::ChannelMismatch {
                expected: target,
                actual: self.channels,
            });
        }
        if target == self.channels {
            return Ok(self.clone());
        }
        if target == 1 {
            return Ok(self.to_mono());
        }

        let frames = self.frames();
        let mut samples = Vec::with_capacity(frames * target);
        for frame in self.samples.chunks_exact(self.channels) {
            if self.channels == 1 {
                samples.extend(std::iter::repeat_n(frame[0], target));
            } else if self.channels > target {
                samples.extend_from_slice(&frame[..target]);
            } else {
                return Err(OfflineError::ChannelMismatch {
                    expected: target,
                    actual: self.channels,
                });
            }
        }

        Ok(AudioBuffer {
            samples,
            channels: target,
            sample_rate: self.sample_rate,
        })
    }

    /// Apply gain
    pub fn apply_gain(&mut self, gain: f32) {
        for sample in &mut self.samples {
            *sample *= gain;
        }
    }

    /// Get peak level (linear)
    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0, f32::max)
    }

    /// Get peak level (dB)
    pub fn peak_db(&self) -> f64 {
        let peak = self.peak();
        if peak <= 0.0 {
            -f64::INFINITY
        } else {
            20.0 * (peak as f64).log10()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_to_stereo() {
        let mono = AudioBuffer {
            samples: vec![0.5, -0.5, 0.25],
            channels: 1,
            sample_rate: 44100,
        };

        let stereo = mono.with_channels(2).unwrap();
        assert_eq!(stereo.channels, 2);
        assert_eq!(stereo.samples, vec![0.5, 0.5, -0.5, -0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_stereo_to_mono() {
        let stereo = AudioBuffer {
            samples: vec![0.5, 0.3, -0.5, -0.3, 0.25, 0.15],
            channels: 2,
            sample_rate: 44100,
        };

        let mono = stereo.to_mono();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples.len(), 3);
        assert!((mono.samples[0] - 0.4).abs() < 0.001);
        assert!((mono.samples[1] + 0.4).abs() < 0.001);
        assert!((mono.samples[2] - 0.2).abs() < 0.001);
    }

    #[test]
    fn test_surround_keeps_front_pair() {
        let surround = AudioBuffer {
            samples: (0..12).map(|i| i as f32).collect(),
            channels: 6,
            sample_rate: 48000,
        };
        let stereo = surround.with_channels(2).unwrap();
        assert_eq!(stereo.samples, vec![0.0, 1.0, 6.0, 7.0]);
    }

    #[test]
    fn test_planar_round_trip() {
        let planes = vec![vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0]];
        let buffer = AudioBuffer::from_planar(&planes, 8000).unwrap();
        assert_eq!(buffer.samples, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(buffer.to_planar(), planes);
        assert!(AudioBuffer::from_planar(&[vec![1.0], vec![]], 8000).is_err());
    }

    #[test]
    fn test_peak_and_gain() {
        let mut buffer = AudioBuffer {
            samples: vec![0.5, -0.8, 0.3, -0.2],
            channels: 1,
            sample_rate: 44100,
        };
        assert!((buffer.peak() - 0.8).abs() < 1e-6);

        buffer.apply_gain(0.5);
        assert!((buffer.peak() - 0.4).abs() < 1e-6);
        assert_eq!(AudioBuffer::new(2, 44100).peak_db(), -f64::INFINITY);
    }
}
