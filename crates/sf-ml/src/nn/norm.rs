//! Normalisation layers

use ndarray::{Array1, Array2, Array3, ArrayViewMut, Axis, Dimension, RemoveAxis, Slice};
use rayon::prelude::*;

use crate::error::{MlError, MlResult};
use crate::weights::WeightStore;

const EPS: f32 = 1e-5;

/// Group normalisation with a per-channel affine transform.
///
/// The channel axis is always axis 0 of the normalised block.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    groups: usize,
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl GroupNorm {
    pub fn new(groups: usize, weight: Array1<f32>, bias: Array1<f32>) -> MlResult<Self> {
        let channels = weight.len();
        if groups == 0 || channels % groups != 0 || bias.len() != channels {
            return Err(MlError::InvalidConfig(format!(
                "GroupNorm: {channels} channels cannot be split into {groups} groups"
            )));
        }
        Ok(Self {
            groups,
            weight,
            bias,
            eps: EPS,
        })
    }

    pub fn load(store: &WeightStore, prefix: &str, groups: usize, channels: usize) -> MlResult<Self> {
        let weight = store.array1(&format!("{prefix}.weight"), channels)?;
        let bias = store.array1(&format!("{prefix}.bias"), channels)?;
        Self::new(groups, weight, bias)
    }

    pub fn channels(&self) -> usize {
        self.weight.len()
    }

    /// `[C, H, W]` with statistics over each group's whole `H x W` block
    pub fn forward(&self, x: &mut Array3<f32>) {
        self.normalize(x.view_mut());
    }

    /// `[C, H, W]` treating each row `h` as an independent batch item
    pub fn forward_rows(&self, x: &mut Array3<f32>) {
        x.axis_iter_mut(Axis(1))
            .into_par_iter()
            .for_each(|row| self.normalize(row));
    }

    /// Token layout `[N, C]`, statistics over all tokens of a group
    pub fn forward_tokens(&self, x: &mut Array2<f32>) {
        self.normalize(x.view_mut().reversed_axes());
    }

    fn normalize<D: Dimension + RemoveAxis>(&self, mut x: ArrayViewMut<f32, D>) {
        let per_group = self.weight.len() / self.groups;
        for g in 0..self.groups {
            let lo = g * per_group;
            let mut block = x.slice_axis_mut(Axis(0), Slice::from(lo..lo + per_group));
            let n = block.len().max(1) as f64;
            let mean = block.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = block
                .iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / n;
            let inv = 1.0 / (var + self.eps as f64).sqrt();

            for (ci, mut channel) in block.axis_iter_mut(Axis(0)).enumerate() {
                let (w, b) = (self.weight[lo + ci], self.bias[lo + ci]);
                channel.mapv_inplace(|v| ((v as f64 - mean) * inv) as f32 * w + b);
            }
        }
    }
}

/// Layer normalisation over the last axis of `[N, C]` tokens
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>) -> Self {
        Self {
            weight,
            bias,
            eps: EPS,
        }
    }

    pub fn load(store: &WeightStore, prefix: &str, dim: usize) -> MlResult<Self> {
        let weight = store.array1(&format!("{prefix}.weight"), dim)?;
        let bias = store.array1(&format!("{prefix}.bias"), dim)?;
        Ok(Self::new(weight, bias))
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut row| {
                let n = row.len() as f32;
                let mean = row.sum() / n;
                let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
                let inv = 1.0 / (var + self.eps).sqrt();
                row.iter_mut()
                    .zip(self.weight.iter().zip(self.bias.iter()))
                    .for_each(|(v, (&w, &b))| *v = (*v - mean) * inv * w + b);
            });
        out
    }
}

/// Learned per-channel rescaling (`LayerScale`)
#[derive(Debug, Clone)]
pub struct LayerScale {
    scale: Array1<f32>,
}

impl LayerScale {
    pub fn new(scale: Array1<f32>) -> Self {
        Self { scale }
    }

    pub fn load(store: &WeightStore, prefix: &str, channels: usize) -> MlResult<Self> {
        Ok(Self::new(store.array1(&format!("{prefix}.scale"), channels)?))
    }

    /// Channels on axis 0 of `[C, H, W]`
    pub fn apply(&self, x: &mut Array3<f32>) {
        let scale = self.scale.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        *x *= &scale;
    }

    /// Channels on the last axis of `[N, C]`
    pub fn apply_tokens(&self, x: &mut Array2<f32>) {
        *x *= &self.scale;
    }
}
