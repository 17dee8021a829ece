//! Audio encoding module
//!
//! WAV through hound: 16/24/32-bit integer with optional dither, or
//! 32-bit float.

use std::io::Cursor;
use std::path::Path;

use rand::Rng;

use crate::buffer::AudioBuffer;
use crate::config::DitheringMode;
use crate::error::{OfflineError, OfflineResult};
use crate::formats::{OutputFormat, WavConfig};

/// Audio encoder trait
pub trait AudioEncoder: Send + Sync {
    /// Encode audio buffer to bytes
    fn encode(&self, buffer: &AudioBuffer) -> OfflineResult<Vec<u8>>;

    /// Get file extension
    fn extension(&self) -> &'static str;

    /// Encode and write to `path`, creating parent directories
    fn write_file(&self, buffer: &AudioBuffer, path: &Path) -> OfflineResult<u64> {
        let data = self.encode(buffer)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OfflineError::WriteError(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(path, &data).map_err(|e| OfflineError::WriteError(format!("{}: {e}", path.display())))?;
        Ok(data.len() as u64)
    }
}

/// WAV encoder using hound
pub struct WavEncoder {
    config: WavConfig,
}

impl WavEncoder {
    pub fn new(config: WavConfig) -> Self {
        Self { config }
    }
}

impl AudioEncoder for WavEncoder {
    fn encode(&self, buffer: &AudioBuffer) -> OfflineResult<Vec<u8>> {
        self.config.validate()?;
        if buffer.channels == 0 || buffer.channels > u16::MAX as usize {
            return Err(OfflineError::EncodingError(format!(
                "cannot write {} channels",
                buffer.channels
            )));
        }

        let mut output = Vec::new();
        let cursor = Cursor::new(&mut output);

        let spec = hound::WavSpec {
            channels: buffer.channels as u16,
            sample_rate: buffer.sample_rate,
            bits_per_sample: self.config.bit_depth as u16,
            sample_format: if self.config.float {
                hound::SampleFormat::Float
            } else {
                hound::SampleFormat::Int
            },
        };

        let mut writer = hound::WavWriter::new(cursor, spec).map_err(|e| OfflineError::EncodingError(e.to_string()))?;

        if self.config.float {
            for &sample in &buffer.samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| OfflineError::EncodingError(e.to_string()))?;
            }
        } else {
            let dithered = apply_dithering(&buffer.samples, self.config.bit_depth, self.config.dithering);
            match self.config.bit_depth {
                16 => {
                    for &sample in &dithered {
                        let s = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                        writer
                            .write_sample(s)
                            .map_err(|e| OfflineError::EncodingError(e.to_string()))?;
                    }
                }
                24 => {
                    for &sample in &dithered {
                        let s = (sample.clamp(-1.0, 1.0) * 8388607.0).round() as i32;
                        writer
                            .write_sample(s)
                            .map_err(|e| OfflineError::EncodingError(e.to_string()))?;
                    }
                }
                _ => {
                    for &sample in &dithered {
                        let s = (sample.clamp(-1.0, 1.0) * 2147483647.0).round() as i32;
                        writer
                            .write_sample(s)
                            .map_err(|e| OfflineError::EncodingError(e.to_string()))?;
                    }
                }
            }
        }

        writer.finalize().map_err(|e| OfflineError::EncodingError(e.to_string()))?;

        Ok(output)
    }

    fn extension(&self) -> &'static str {
        "wav"
    }
}

/// Create encoder for output format
pub fn create_encoder(format: &OutputFormat) -> Box<dyn AudioEncoder> {
    match format {
        OutputFormat::Wav(config) => Box::new(WavEncoder::new(config.clone())),
    }
}

/// Add dither noise scaled to one LSB of `target_bits`
fn apply_dithering(samples: &[f32], target_bits: u8, mode: DitheringMode) -> Vec<f64> {
    let step = 1.0 / ((1i64 << (target_bits.clamp(2, 32) - 1)) as f64);
    let mut rng = rand::rng();

    match mode {
        DitheringMode::None => samples.iter().map(|&s| s as f64).collect(),
        DitheringMode::Rectangular => samples
            .iter()
            .map(|&s| s as f64 + (rng.random_range(0.0..1.0) - 0.5) * step)
            .collect(),
        DitheringMode::Triangular => samples
            .iter()
            .map(|&s| {
                // TPDF: sum of two uniform random values
                let r1: f64 = rng.random_range(0.0..1.0);
                let r2: f64 = rng.random_range(0.0..1.0);
                s as f64 + (r1 + r2 - 1.0) * step
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> AudioBuffer {
        AudioBuffer {
            samples: (0..2000).map(|i| ((i / 2) as f32 * 0.01).sin() * 0.8).collect(),
            channels: 2,
            sample_rate: 44100,
        }
    }

    fn read_back(bytes: Vec<u8>) -> (hound::WavSpec, Vec<f32>) {
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().map(|s| s.unwrap()).collect(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader.samples::<i32>().map(|s| s.unwrap() as f32 / scale).collect()
            }
        };
        (spec, samples)
    }

    #[test]
    fn test_wav_16_round_trip() {
        let input = buffer();
        let bytes = WavEncoder::new(WavConfig::default()).encode(&input).unwrap();
        let (spec, samples) = read_back(bytes);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(samples.len(), input.samples.len());
        for (a, b) in samples.iter().zip(&input.samples) {
            assert!((a - b).abs() < 3.0 / 32768.0);
        }
    }

    #[test]
    fn test_wav_float_is_exact() {
        let input = buffer();
        let encoder = create_encoder(&OutputFormat::wav_32f());
        assert_eq!(encoder.extension(), "wav");
        let (spec, samples) = read_back(encoder.encode(&input).unwrap());
        assert_eq!(spec.sample_format, hound::SampleFormat::Float);
        assert_eq!(samples, input.samples);
    }

    #[test]
    fn test_wav_24_without_dither() {
        let input = buffer();
        let config = WavConfig {
            bit_depth: 24,
            float: false,
            dithering: DitheringMode::None,
        };
        let (spec, samples) = read_back(WavEncoder::new(config).encode(&input).unwrap());
        assert_eq!(spec.bits_per_sample, 24);
        for (a, b) in samples.iter().zip(&input.samples) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_write_file_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song").join("vocals.wav");
        let written = WavEncoder::new(WavConfig::default()).write_file(&buffer(), &path).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), written);
    }

    #[test]
    fn test_dither_is_bounded() {
        let silence = vec![0.0f32; 1000];
        let dithered = apply_dithering(&silence, 16, DitheringMode::Triangular);
        let lsb = 1.0 / 32768.0;
        assert!(dithered.iter().all(|d| d.abs() <= lsb));
        assert!(dithered.iter().any(|d| *d != 0.0));
    }
}
