//! Fully connected layer over `[N, in]` token matrices

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{MlError, MlResult};
use crate::weights::WeightStore;

#[derive(Debug, Clone)]
pub struct Linear {
    /// `[in, out]`, pre-transposed from the stored `[out, in]`
    weight_t: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    /// From a PyTorch `[out, in]` weight
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight_t: weight.reversed_axes().as_standard_layout().into_owned(),
            bias,
        }
    }

    pub fn load(store: &WeightStore, prefix: &str, in_features: usize, out_features: usize) -> MlResult<Self> {
        let weight = store.array2(&format!("{prefix}.weight"), [out_features, in_features])?;
        let bias = store.array1(&format!("{prefix}.bias"), out_features)?;
        Ok(Self::new(weight, Some(bias)))
    }

    /// From a kernel-size-1 `Conv1d` (`[out, in, 1]` weight)
    pub fn load_pointwise(store: &WeightStore, prefix: &str, in_features: usize, out_features: usize) -> MlResult<Self> {
        let weight = store
            .array3(&format!("{prefix}.weight"), [out_features, in_features, 1])?
            .index_axis_move(Axis(2), 0);
        let bias = store.array1(&format!("{prefix}.bias"), out_features)?;
        Ok(Self::new(weight, Some(bias)))
    }

    pub fn in_features(&self) -> usize {
        self.weight_t.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight_t.ncols()
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(MlError::InvalidInputShape {
                expected: format!("[N, {}]", self.in_features()),
                got: format!("{:?}", x.shape()),
            });
        }
        let mut out = x.dot(&self.weight_t);
        if let Some(b) = &self.bias {
            out += b;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear() {
        // out = [x0 + x1, 2*x0] + [1, 0]
        let lin = Linear::new(array![[1.0, 1.0], [2.0, 0.0]], Some(array![1.0, 0.0]));
        let y = lin.forward(array![[1.0, 2.0], [0.5, 0.5]].view()).unwrap();
        assert_eq!(y, array![[4.0, 2.0], [2.0, 1.0]]);
    }

    #[test]
    fn test_linear_wrong_width() {
        let lin = Linear::new(Array2::zeros((3, 2)), None);
        assert!(lin.forward(Array2::zeros((1, 3)).view()).is_err());
    }
}
