//! Spectrogram front-end of the hybrid model
//!
//! Frames are aligned so the spectrogram has exactly `ceil(L / hop)` frames
//! with `nfft / 2` bins (the Nyquist bin is dropped); the inverse undoes the
//! same framing and trims back to the requested length.

use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{MlError, MlResult};

/// Short-time Fourier transform pair used by HTDemucs
pub struct Spectrogram {
    nfft: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

impl std::fmt::Debug for Spectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spectrogram")
            .field("nfft", &self.nfft)
            .field("hop", &self.hop)
            .finish()
    }
}

impl Spectrogram {
    /// `hop` is fixed to `nfft / 4`
    pub fn new(nfft: usize) -> MlResult<Self> {
        if nfft < 8 || nfft % 4 != 0 {
            return Err(MlError::InvalidConfig(format!(
                "nfft must be a multiple of 4, got {nfft}"
            )));
        }
        let mut planner = RealFftPlanner::<f32>::new();
        Ok(Self {
            nfft,
            hop: nfft / 4,
            window: hann_window(nfft),
            forward: planner.plan_fft_forward(nfft),
            inverse: planner.plan_fft_inverse(nfft),
        })
    }

    pub fn nfft(&self) -> usize {
        self.nfft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of frames for a signal of `length` samples
    pub fn frames(&self, length: usize) -> usize {
        length.div_ceil(self.hop)
    }

    /// `[C, L] -> [C, nfft/2, ceil(L/hop)]`
    pub fn spec(&self, x: ArrayView2<f32>) -> MlResult<Array3<Complex32>> {
        let (channels, length) = x.dim();
        if length == 0 {
            return Err(MlError::InvalidInputShape {
                expected: "non-empty signal".into(),
                got: "0 samples".into(),
            });
        }
        let hl = self.hop;
        let le = self.frames(length);
        let pad = hl / 2 * 3;
        let bins = self.nfft / 2;

        let mut out = Array3::<Complex32>::zeros((channels, bins, le));
        let mut frame = self.forward.make_input_vec();
        let mut spectrum = self.forward.make_output_vec();
        let mut scratch = self.forward.make_scratch_vec();
        let norm = 1.0 / (self.nfft as f32).sqrt();

        for (c, row) in x.axis_iter(Axis(0)).enumerate() {
            let signal: Vec<f32> = row.iter().copied().collect();
            let padded = pad_reflect(&signal, pad, pad + le * hl - length);
            let centered = pad_reflect(&padded, self.nfft / 2, self.nfft / 2);

            // frames 2..2+le of the centred transform
            for t in 0..le {
                let start = (t + 2) * hl;
                for (i, v) in frame.iter_mut().enumerate() {
                    *v = centered[start + i] * self.window[i];
                }
                self.forward
                    .process_with_scratch(&mut frame, &mut spectrum, &mut scratch)
                    .map_err(|e| MlError::ProcessingFailed(format!("FFT failed: {e}")))?;
                for f in 0..bins {
                    out[[c, f, t]] = spectrum[f] * norm;
                }
            }
        }

        Ok(out)
    }

    /// `[C, nfft/2, T] -> [C, length]`
    pub fn ispec(&self, z: ArrayView3<Complex32>, length: usize) -> MlResult<Array2<f32>> {
        let (channels, bins, le) = z.dim();
        if bins != self.nfft / 2 {
            return Err(MlError::InvalidInputShape {
                expected: format!("{} frequency bins", self.nfft / 2),
                got: bins.to_string(),
            });
        }
        let hl = self.hop;
        let pad = hl / 2 * 3;
        // two zero frames on each side
        let n_frames = le + 4;
        let total = self.nfft + hl * (n_frames - 1);
        let target = hl * length.div_ceil(hl) + 2 * pad;
        let start = self.nfft / 2;
        if start + pad + length > total || target > total - start {
            return Err(MlError::InvalidInputShape {
                expected: format!("at least {} frames", length.div_ceil(hl)),
                got: le.to_string(),
            });
        }

        // window-squared envelope, identical for every channel
        let mut envelope = vec![0.0f32; total];
        for t in 0..n_frames {
            for (i, w) in self.window.iter().enumerate() {
                envelope[t * hl + i] += w * w;
            }
        }

        let norm = 1.0 / (self.nfft as f32).sqrt();
        let mut spectrum = self.inverse.make_input_vec();
        let mut frame = self.inverse.make_output_vec();
        let mut scratch = self.inverse.make_scratch_vec();
        let mut out = Array2::<f32>::zeros((channels, length));

        for c in 0..channels {
            let mut signal = vec![0.0f32; total];
            for t in 0..le {
                for f in 0..bins {
                    spectrum[f] = z[[c, f, t]];
                }
                spectrum[bins] = Complex32::new(0.0, 0.0);
                spectrum[0].im = 0.0;

                self.inverse
                    .process_with_scratch(&mut spectrum, &mut frame, &mut scratch)
                    .map_err(|e| MlError::ProcessingFailed(format!("IFFT failed: {e}")))?;

                let offset = (t + 2) * hl;
                for (i, v) in frame.iter().enumerate() {
                    signal[offset + i] += v * norm * self.window[i];
                }
            }

            for n in 0..length {
                let p = start + pad + n;
                if envelope[p] > 1e-11 {
                    out[[c, n]] = signal[p] / envelope[p];
                }
            }
        }

        Ok(out)
    }
}

/// Periodic Hann window
pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()))
        .collect()
}

/// Reflect padding that zero-extends signals too short to reflect
pub fn pad_reflect(x: &[f32], left: usize, right: usize) -> Vec<f32> {
    let mut left = left;
    let mut right = right;
    let max_pad = left.max(right);

    let mut base = x.to_vec();
    if base.len() <= max_pad {
        let extra = max_pad - base.len() + 1;
        let extra_right = right.min(extra);
        let extra_left = extra - extra_right;
        left -= extra_left;
        right -= extra_right;
        let mut extended = vec![0.0; extra_left];
        extended.extend_from_slice(&base);
        extended.extend(std::iter::repeat_n(0.0, extra_right));
        base = extended;
    }

    let n = base.len();
    let mut out = Vec::with_capacity(n + left + right);
    out.extend((0..left).map(|i| base[left - i]));
    out.extend_from_slice(&base);
    out.extend((0..right).map(|j| base[n - 2 - j]));
    out
}

/// Complex-as-channels: `[C, F, T]` complex to `[2C, F, T]` real,
/// ordered `(c0.re, c0.im, c1.re, c1.im, ...)`
pub fn complex_as_channels(z: &Array3<Complex32>) -> Array3<f32> {
    let (channels, bins, frames) = z.dim();
    Array3::from_shape_fn((channels * 2, bins, frames), |(c, f, t)| {
        let v = z[[c / 2, f, t]];
        if c % 2 == 0 { v.re } else { v.im }
    })
}

/// Inverse of [`complex_as_channels`]
pub fn channels_as_complex(m: ArrayView3<f32>) -> MlResult<Array3<Complex32>> {
    let (channels, bins, frames) = m.dim();
    if channels % 2 != 0 {
        return Err(MlError::InvalidInputShape {
            expected: "even channel count".into(),
            got: channels.to_string(),
        });
    }
    Ok(Array3::from_shape_fn((channels / 2, bins, frames), |(c, f, t)| {
        Complex32::new(m[[2 * c, f, t]], m[[2 * c + 1, f, t]])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tones(length: usize) -> Array2<f32> {
        Array2::from_shape_fn((2, length), |(c, n)| {
            let t = n as f32;
            0.5 * (0.02 * t).sin() + 0.25 * (0.11 * t + c as f32).cos()
        })
    }

    #[test]
    fn test_hann_window() {
        let window = hann_window(1024);
        assert_eq!(window.len(), 1024);
        assert!(window[0] < 0.01);
        assert!(window[512] > 0.99);
        assert!(window[1023] < 0.01);
    }

    #[test]
    fn test_pad_reflect() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(pad_reflect(&x, 2, 1), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0]);
    }

    #[test]
    fn test_pad_reflect_short_signal_is_zero_extended() {
        let x = [1.0, 2.0];
        let out = pad_reflect(&x, 1, 3);
        assert_eq!(out.len(), 2 + 1 + 3);
        // extended to [1, 2, 0, 0] before reflecting
        assert_eq!(out, vec![2.0, 1.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_spec_shape() {
        let spec = Spectrogram::new(256).unwrap();
        let z = spec.spec(tones(1000).view()).unwrap();
        assert_eq!(z.dim(), (2, 128, 1000usize.div_ceil(64)));
    }

    #[test]
    fn test_round_trip_interior() {
        let spec = Spectrogram::new(256).unwrap();
        let length = 2000;
        let x = tones(length);
        let z = spec.spec(x.view()).unwrap();
        let y = spec.ispec(z.view(), length).unwrap();

        assert_eq!(y.dim(), (2, length));
        let hop = spec.hop();
        for c in 0..2 {
            for n in 2 * hop..length - 2 * hop {
                assert_abs_diff_eq!(y[[c, n]], x[[c, n]], epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_complex_channel_layout() {
        let z = Array3::from_shape_fn((2, 1, 1), |(c, _, _)| Complex32::new(c as f32, 10.0 + c as f32));
        let m = complex_as_channels(&z);
        assert_eq!(m.iter().copied().collect::<Vec<_>>(), vec![0.0, 10.0, 1.0, 11.0]);

        let back = channels_as_complex(m.view()).unwrap();
        assert_eq!(back, z);
    }

    #[test]
    fn test_rejects_bad_nfft() {
        assert!(Spectrogram::new(30).is_err());
    }
}
