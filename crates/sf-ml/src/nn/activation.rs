//! Activation functions

use ndarray::{Array, Array3, Axis, Dimension, s};

use crate::error::{MlError, MlResult};

/// Arrays above this size are mapped in parallel
const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Exact GELU: `x * 0.5 * (1 + erf(x / sqrt(2)))`
#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
}

#[inline(always)]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// In-place GELU on any array
pub fn gelu<D: Dimension>(x: &mut Array<f32, D>) {
    if x.len() >= PARALLEL_THRESHOLD {
        x.par_mapv_inplace(gelu_scalar);
    } else {
        x.mapv_inplace(gelu_scalar);
    }
}

/// Gated linear unit over the channel axis of `[C, H, W]`:
/// the first half of the channels gated by the sigmoid of the second half.
pub fn glu(x: &Array3<f32>) -> MlResult<Array3<f32>> {
    let channels = x.len_of(Axis(0));
    if channels % 2 != 0 {
        return Err(MlError::InvalidInputShape {
            expected: "even channel count for GLU".into(),
            got: channels.to_string(),
        });
    }
    let half = channels / 2;
    let mut out = x.slice(s![..half, .., ..]).to_owned();
    out.zip_mut_with(&x.slice(s![half.., .., ..]), |a, &b| *a *= sigmoid(b));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_gelu_reference_values() {
        assert_abs_diff_eq!(gelu_scalar(0.0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(gelu_scalar(1.0), 0.841_344_7, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu_scalar(-1.0), -0.158_655_3, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu_scalar(3.0), 2.995_950_4, epsilon = 1e-5);
    }

    #[test]
    fn test_gelu_array_matches_scalar() {
        let mut x = ndarray::Array1::linspace(-4.0, 4.0, 33);
        let expected: Vec<f32> = x.iter().map(|&v| gelu_scalar(v)).collect();
        gelu(&mut x);
        assert_eq!(x.to_vec(), expected);
    }

    #[test]
    fn test_glu() {
        // channels [a, b]: out = a * sigmoid(b)
        let x = Array3::from_shape_vec((2, 1, 2), vec![2.0, -4.0, 0.0, 100.0]).unwrap();
        let y = glu(&x).unwrap();
        assert_eq!(y.dim(), (1, 1, 2));
        assert_abs_diff_eq!(y[[0, 0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 0, 1]], -4.0, epsilon = 1e-4);
    }

    #[test]
    fn test_glu_odd_channels() {
        let x = Array3::<f32>::zeros((3, 1, 1));
        assert!(glu(&x).is_err());
    }
}
