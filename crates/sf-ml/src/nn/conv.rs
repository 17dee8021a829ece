//! Convolutions over `[channels, height, width]` feature maps
//!
//! The spectral branch works on `[C, F, T]` and the waveform branch on
//! `[C, 1, T]`, so every 1D convolution along time is a 2D convolution with a
//! `1 x k` kernel and the frequency-axis convolutions use `k x 1` kernels.
//! Forward passes lower to im2col + GEMM over column tiles run on rayon.

use ndarray::{s, Array1, Array2, Array3, ArrayView3, Axis};
use rayon::prelude::*;

use crate::error::{MlError, MlResult};
use crate::weights::WeightStore;

/// Output columns gathered per GEMM tile
const COLUMN_TILE: usize = 2048;

/// Kernel geometry, as `(height, width)` pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
}

impl ConvGeometry {
    pub fn new(kernel: (usize, usize)) -> Self {
        Self {
            kernel,
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
        }
    }

    /// Output extent along one axis, `None` if the input is too short
    fn out_len(input: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> Option<usize> {
        let span = dilation * (kernel - 1) + 1;
        let padded = input + 2 * padding;
        (padded >= span).then(|| (padded - span) / stride + 1)
    }

    /// Output `(height, width)` for an input of `(h, w)`
    pub fn output_size(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let ho = Self::out_len(h, self.kernel.0, self.stride.0, self.padding.0, self.dilation.0)?;
        let wo = Self::out_len(w, self.kernel.1, self.stride.1, self.padding.1, self.dilation.1)?;
        Some((ho, wo))
    }
}

/// 2D convolution (`nn.Conv2d` / `nn.Conv1d` weights)
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `[out, in * kh * kw]`
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
}

impl Conv2d {
    /// From a `[out, in, kh, kw]` weight
    pub fn new(weight: ndarray::Array4<f32>, bias: Option<Array1<f32>>) -> MlResult<Self> {
        let (out_channels, in_channels, kh, kw) = weight.dim();
        let weight = weight
            .into_shape_with_order((out_channels, in_channels * kh * kw))
            .map_err(|e| MlError::ProcessingFailed(format!("conv weight: {e}")))?;
        Self::from_matrix(weight, bias, in_channels, ConvGeometry::new((kh, kw)))
    }

    /// From a `[out, in, k]` Conv1d weight, applied along the width axis
    pub fn new_1d(weight: Array3<f32>, bias: Option<Array1<f32>>) -> MlResult<Self> {
        let (out_channels, in_channels, k) = weight.dim();
        let weight = weight
            .into_shape_with_order((out_channels, in_channels * k))
            .map_err(|e| MlError::ProcessingFailed(format!("conv weight: {e}")))?;
        Self::from_matrix(weight, bias, in_channels, ConvGeometry::new((1, k)))
    }

    fn from_matrix(
        weight: Array2<f32>,
        bias: Option<Array1<f32>>,
        in_channels: usize,
        geometry: ConvGeometry,
    ) -> MlResult<Self> {
        let out_channels = weight.nrows();
        if let Some(b) = &bias {
            if b.len() != out_channels {
                return Err(MlError::ChannelMismatch {
                    expected: out_channels,
                    got: b.len(),
                });
            }
        }
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            geometry,
        })
    }

    /// Load `{prefix}.weight` `[out, in, kh, kw]` and `{prefix}.bias`
    pub fn load(store: &WeightStore, prefix: &str, shape: [usize; 4]) -> MlResult<Self> {
        let weight = store.array4(&format!("{prefix}.weight"), shape)?;
        let bias = store.array1(&format!("{prefix}.bias"), shape[0])?;
        Self::new(weight, Some(bias))
    }

    /// Load a Conv1d `{prefix}.weight` `[out, in, k]` and `{prefix}.bias`
    pub fn load_1d(store: &WeightStore, prefix: &str, shape: [usize; 3]) -> MlResult<Self> {
        let weight = store.array3(&format!("{prefix}.weight"), shape)?;
        let bias = store.array1(&format!("{prefix}.bias"), shape[0])?;
        Self::new_1d(weight, Some(bias))
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.geometry.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.geometry.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.geometry.dilation = dilation;
        self
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    /// `[in, H, W] -> [out, H', W']`
    pub fn forward(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        let (cin, h, w) = x.dim();
        if cin != self.in_channels {
            return Err(MlError::ChannelMismatch {
                expected: self.in_channels,
                got: cin,
            });
        }
        let (ho, wo) = self.geometry.output_size(h, w).ok_or_else(|| MlError::InvalidInputShape {
            expected: format!("input larger than kernel {:?}", self.geometry.kernel),
            got: format!("[{cin}, {h}, {w}]"),
        })?;

        let n = ho * wo;
        let starts: Vec<usize> = (0..n).step_by(COLUMN_TILE).collect();
        let tiles: Vec<Array2<f32>> = starts
            .into_par_iter()
            .map(|start| {
                let end = (start + COLUMN_TILE).min(n);
                let cols = self.gather_columns(x, start, end, wo);
                let mut out = self.weight.dot(&cols);
                if let Some(b) = &self.bias {
                    out += &b.view().insert_axis(Axis(1));
                }
                out
            })
            .collect();

        let mut out = Array2::<f32>::zeros((self.out_channels, n));
        let mut start = 0;
        for tile in tiles {
            let width = tile.ncols();
            out.slice_mut(s![.., start..start + width]).assign(&tile);
            start += width;
        }

        out.into_shape_with_order((self.out_channels, ho, wo))
            .map_err(|e| MlError::ProcessingFailed(format!("conv output: {e}")))
    }

    /// im2col for output positions `start..end`
    fn gather_columns(&self, x: ArrayView3<f32>, start: usize, end: usize, wo: usize) -> Array2<f32> {
        let (cin, h, w) = x.dim();
        let ConvGeometry {
            kernel: (kh, kw),
            stride: (sh, sw),
            padding: (ph, pw),
            dilation: (dh, dw),
        } = self.geometry;

        let mut cols = Array2::<f32>::zeros((cin * kh * kw, end - start));
        for c in 0..cin {
            for ky in 0..kh {
                for kx in 0..kw {
                    let mut row = cols.row_mut((c * kh + ky) * kw + kx);
                    for (j, idx) in (start..end).enumerate() {
                        let iy = (idx / wo) * sh + ky * dh;
                        let ix = (idx % wo) * sw + kx * dw;
                        if iy < ph || ix < pw || iy - ph >= h || ix - pw >= w {
                            continue;
                        }
                        row[j] = x[[c, iy - ph, ix - pw]];
                    }
                }
            }
        }
        cols
    }
}

/// Transposed convolution without padding (`nn.ConvTranspose2d` / `1d`).
///
/// Callers crop the output themselves.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// `[out * kh * kw, in]`
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl ConvTranspose2d {
    /// From a `[in, out, kh, kw]` weight
    pub fn new(weight: ndarray::Array4<f32>, bias: Option<Array1<f32>>, stride: (usize, usize)) -> MlResult<Self> {
        let (in_channels, out_channels, kh, kw) = weight.dim();
        let weight = weight
            .into_shape_with_order((in_channels, out_channels * kh * kw))
            .map_err(|e| MlError::ProcessingFailed(format!("conv_tr weight: {e}")))?
            .reversed_axes()
            .as_standard_layout()
            .into_owned();
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel: (kh, kw),
            stride,
        })
    }

    /// From a `[in, out, k]` ConvTranspose1d weight, along the width axis
    pub fn new_1d(weight: Array3<f32>, bias: Option<Array1<f32>>, stride: usize) -> MlResult<Self> {
        let weight = weight.insert_axis(Axis(2));
        Self::new(weight, bias, (1, stride))
    }

    pub fn load(store: &WeightStore, prefix: &str, shape: [usize; 4], stride: (usize, usize)) -> MlResult<Self> {
        let weight = store.array4(&format!("{prefix}.weight"), shape)?;
        let bias = store.array1(&format!("{prefix}.bias"), shape[1])?;
        Self::new(weight, Some(bias), stride)
    }

    pub fn load_1d(store: &WeightStore, prefix: &str, shape: [usize; 3], stride: usize) -> MlResult<Self> {
        let weight = store.array3(&format!("{prefix}.weight"), shape)?;
        let bias = store.array1(&format!("{prefix}.bias"), shape[1])?;
        Self::new_1d(weight, Some(bias), stride)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// `[in, H, W] -> [out, (H-1)*sh + kh, (W-1)*sw + kw]`
    pub fn forward(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        let (cin, h, w) = x.dim();
        if cin != self.in_channels {
            return Err(MlError::ChannelMismatch {
                expected: self.in_channels,
                got: cin,
            });
        }
        if h == 0 || w == 0 {
            return Err(MlError::InvalidInputShape {
                expected: "non-empty feature map".into(),
                got: format!("[{cin}, {h}, {w}]"),
            });
        }
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let ho = (h - 1) * sh + kh;
        let wo = (w - 1) * sw + kw;

        let flat = x
            .to_shape((cin, h * w))
            .map_err(|e| MlError::ProcessingFailed(format!("conv_tr input: {e}")))?;
        let cols = self.weight.dot(&flat);

        let mut out = Array3::<f32>::zeros((self.out_channels, ho, wo));
        out.outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .for_each(|(co, mut plane)| {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = cols.row((co * kh + ky) * kw + kx);
                        for iy in 0..h {
                            let oy = iy * sh + ky;
                            for ix in 0..w {
                                plane[[oy, ix * sw + kx]] += row[iy * w + ix];
                            }
                        }
                    }
                }
                if let Some(b) = &self.bias {
                    plane += b[co];
                }
            });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array4};

    #[test]
    fn test_conv1d_valid() {
        // one in/out channel, kernel [1, 2, 3]
        let weight = Array3::from_shape_vec((1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let conv = Conv2d::new_1d(weight, Some(array![0.5])).unwrap();
        let x = Array3::from_shape_vec((1, 1, 5), vec![1.0, 0.0, -1.0, 2.0, 1.0]).unwrap();

        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (1, 1, 3));
        // 1*1 + 0*2 + -1*3 + 0.5
        assert_abs_diff_eq!(y[[0, 0, 0]], -1.5, epsilon = 1e-6);
        // 0 - 2 + 6 + 0.5
        assert_abs_diff_eq!(y[[0, 0, 1]], 4.5, epsilon = 1e-6);
        // -1 + 4 + 3 + 0.5
        assert_abs_diff_eq!(y[[0, 0, 2]], 6.5, epsilon = 1e-6);
    }

    #[test]
    fn test_conv1d_stride_padding_dilation() {
        let weight = Array3::from_shape_vec((1, 1, 3), vec![1.0, 1.0, 1.0]).unwrap();
        let x = Array3::from_shape_vec((1, 1, 6), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let padded = Conv2d::new_1d(weight.clone(), None)
            .unwrap()
            .with_padding((0, 1))
            .with_stride((1, 2));
        let y = padded.forward(x.view()).unwrap();
        // windows: [0,1,2] [2,3,4] [4,5,6]
        assert_eq!(y.into_raw_vec_and_offset().0, vec![3.0, 9.0, 15.0]);

        let dilated = Conv2d::new_1d(weight, None)
            .unwrap()
            .with_padding((0, 2))
            .with_dilation((1, 2));
        let y = dilated.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (1, 1, 6));
        // x[-2] + x[0] + x[2] = 0 + 1 + 3
        assert_abs_diff_eq!(y[[0, 0, 0]], 4.0, epsilon = 1e-6);
        // x[1] + x[3] + x[5]
        assert_abs_diff_eq!(y[[0, 0, 3]], 2.0 + 4.0 + 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_frequency_kernel_runs_per_column() {
        // kernel [2, 1] sums adjacent rows independently for each column
        let weight = Array4::from_shape_vec((1, 1, 2, 1), vec![1.0, 1.0]).unwrap();
        let conv = Conv2d::new(weight, None).unwrap().with_stride((2, 1));
        let x = Array3::from_shape_vec((1, 4, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]).unwrap();

        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (1, 2, 2));
        assert_eq!(y[[0, 0, 0]], 3.0);
        assert_eq!(y[[0, 0, 1]], 30.0);
        assert_eq!(y[[0, 1, 0]], 7.0);
        assert_eq!(y[[0, 1, 1]], 70.0);
    }

    #[test]
    fn test_multichannel_matches_naive() {
        let (cin, cout, k, t) = (3, 2, 3, 9);
        let weight = Array3::from_shape_fn((cout, cin, k), |(o, i, j)| (o * 7 + i * 3 + j) as f32 * 0.1 - 0.5);
        let bias = Array1::from_vec(vec![0.25, -0.25]);
        let x = Array3::from_shape_fn((cin, 1, t), |(c, _, i)| ((c + 1) * i) as f32 * 0.05);

        let conv = Conv2d::new_1d(weight.clone(), Some(bias.clone())).unwrap().with_padding((0, 1));
        let y = conv.forward(x.view()).unwrap();

        for o in 0..cout {
            for n in 0..t {
                let mut acc = bias[o];
                for i in 0..cin {
                    for j in 0..k {
                        let pos = n as isize + j as isize - 1;
                        if pos >= 0 && (pos as usize) < t {
                            acc += weight[[o, i, j]] * x[[i, 0, pos as usize]];
                        }
                    }
                }
                assert_abs_diff_eq!(y[[o, 0, n]], acc, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_too_short_input_is_an_error() {
        let weight = Array3::from_shape_vec((1, 1, 4), vec![1.0; 4]).unwrap();
        let conv = Conv2d::new_1d(weight, None).unwrap();
        let x = Array3::<f32>::zeros((1, 1, 2));
        assert!(conv.forward(x.view()).is_err());
    }

    #[test]
    fn test_conv_transpose_1d() {
        // in=1, out=1, kernel [1, 2], stride 2 -> each input spreads to 2 outputs
        let weight = Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap();
        let conv = ConvTranspose2d::new_1d(weight, Some(array![0.0]), 2).unwrap();
        let x = Array3::from_shape_vec((1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();

        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (1, 1, 6));
        assert_eq!(y.into_raw_vec_and_offset().0, vec![1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
    }

    #[test]
    fn test_conv_transpose_overlap_adds() {
        // kernel 3, stride 1: overlapping contributions accumulate
        let weight = Array3::from_shape_vec((1, 1, 3), vec![1.0, 1.0, 1.0]).unwrap();
        let conv = ConvTranspose2d::new_1d(weight, Some(array![1.0]), 1).unwrap();
        let x = Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap();

        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.into_raw_vec_and_offset().0, vec![2.0, 4.0, 4.0, 3.0]);
    }

    #[test]
    fn test_conv_transpose_frequency_axis() {
        // [in=1, out=2, kh=2, kw=1], stride (2, 1)
        let weight = Array4::from_shape_vec((1, 2, 2, 1), vec![1.0, -1.0, 0.5, 0.5]).unwrap();
        let conv = ConvTranspose2d::new(weight, None, (2, 1)).unwrap();
        let x = Array3::from_shape_vec((1, 2, 1), vec![2.0, 4.0]).unwrap();

        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (2, 4, 1));
        assert_eq!(y.slice(s![0, .., 0]).to_vec(), vec![2.0, -2.0, 4.0, -4.0]);
        assert_eq!(y.slice(s![1, .., 0]).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }
}
