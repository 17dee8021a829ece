//! Sample rate conversion with rubato's FFT resampler
//!
//! The resampler's output delay is trimmed so the result lines up with the
//! input, and the output holds exactly `ceil(frames * target / source)`
//! frames.

use rubato::{FftFixedIn, Resampler as _};

use crate::buffer::AudioBuffer;
use crate::config::SrcQuality;
use crate::error::{OfflineError, OfflineResult};

/// Whole-buffer resampler
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    quality: SrcQuality,
}

impl Resampler {
    pub fn new(quality: SrcQuality) -> Self {
        Self { quality }
    }

    /// Frames produced for `frames` input frames
    pub fn output_frames(frames: usize, source_rate: u32, target_rate: u32) -> usize {
        (frames as u64 * target_rate as u64).div_ceil(source_rate.max(1) as u64) as usize
    }

    /// Convert `buffer` to `target_rate`; a matching rate returns a copy
    pub fn process(&self, buffer: &AudioBuffer, target_rate: u32) -> OfflineResult<AudioBuffer> {
        if target_rate == 0 || buffer.sample_rate == 0 {
            return Err(OfflineError::SampleRateConversion(format!(
                "invalid rates {} -> {}",
                buffer.sample_rate, target_rate
            )));
        }
        if buffer.sample_rate == target_rate || buffer.is_empty() {
            return Ok(AudioBuffer {
                sample_rate: target_rate,
                ..buffer.clone()
            });
        }

        let channels = buffer.channels;
        let frames = buffer.frames();
        let expected = Self::output_frames(frames, buffer.sample_rate, target_rate);
        let (chunk, sub_chunks) = self.quality.fft_params();

        let mut resampler = FftFixedIn::<f32>::new(
            buffer.sample_rate as usize,
            target_rate as usize,
            chunk,
            sub_chunks,
            channels,
        )
        .map_err(|e| OfflineError::SampleRateConversion(e.to_string()))?;

        let delay = resampler.output_delay();
        let input = buffer.to_planar();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];
        let mut scratch = resampler.output_buffer_allocate(true);

        let mut pos = 0;
        while frames - pos >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let block: Vec<&[f32]> = input.iter().map(|c| &c[pos..pos + needed]).collect();
            let (_, written) = resampler
                .process_into_buffer(&block, &mut scratch, None)
                .map_err(|e| OfflineError::SampleRateConversion(e.to_string()))?;
            append(&mut output, &scratch, written);
            pos += needed;
        }

        if pos < frames {
            let rest: Vec<&[f32]> = input.iter().map(|c| &c[pos..]).collect();
            let (_, written) = resampler
                .process_partial_into_buffer(Some(rest.as_slice()), &mut scratch, None)
                .map_err(|e| OfflineError::SampleRateConversion(e.to_string()))?;
            append(&mut output, &scratch, written);
        }

        // flush the delay line
        while output[0].len() < expected + delay {
            let (_, written) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut scratch, None)
                .map_err(|e| OfflineError::SampleRateConversion(e.to_string()))?;
            if written == 0 {
                break;
            }
            append(&mut output, &scratch, written);
        }

        let planes: Vec<Vec<f32>> = output
            .into_iter()
            .map(|mut plane| {
                plane.resize(expected + delay, 0.0);
                plane.split_off(delay)
            })
            .collect();

        log::debug!(
            "Resampled {} frames {} Hz -> {} frames {} Hz",
            frames,
            buffer.sample_rate,
            expected,
            target_rate
        );
        AudioBuffer::from_planar(&planes, target_rate)
    }
}

fn append(output: &mut [Vec<f32>], scratch: &[Vec<f32>], written: usize) {
    for (out, data) in output.iter_mut().zip(scratch) {
        out.extend_from_slice(&data[..written]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(rate: u32, freq: f32, frames: usize, channels: usize) -> AudioBuffer {
        let samples = (0..frames)
            .flat_map(|i| {
                let v = (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5;
                std::iter::repeat_n(v, channels)
            })
            .collect();
        AudioBuffer {
            samples,
            channels,
            sample_rate: rate,
        }
    }

    #[test]
    fn test_output_length() {
        let resampler = Resampler::default();
        for (src, dst, frames) in [(48000, 44100, 10_000), (22050, 44100, 3333), (44100, 8000, 4410)] {
            let out = resampler.process(&sine(src, 440.0, frames, 2), dst).unwrap();
            assert_eq!(out.frames(), Resampler::output_frames(frames, src, dst));
            assert_eq!(out.channels, 2);
            assert_eq!(out.sample_rate, dst);
        }
    }

    #[test]
    fn test_same_rate_is_copy() {
        let input = sine(44100, 440.0, 1000, 1);
        let out = Resampler::default().process(&input, 44100).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_sine_is_preserved() {
        // a low tone keeps its amplitude and phase after delay compensation
        let input = sine(48000, 200.0, 48000, 1);
        let out = Resampler::new(SrcQuality::Best).process(&input, 44100).unwrap();
        let reference = sine(44100, 200.0, 44100, 1);
        for i in (2000..42000).step_by(997) {
            assert_abs_diff_eq!(out.samples[i], reference.samples[i], epsilon = 0.02);
        }
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(Resampler::default().process(&sine(44100, 440.0, 10, 1), 0).is_err());
    }
}
