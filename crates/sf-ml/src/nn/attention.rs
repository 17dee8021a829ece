//! Attention layers over `[N, C]` tokens
//!
//! - [`MultiheadAttention`]: packed input projections (`nn.MultiheadAttention` layout)
//! - [`LocalAttention`]: self-attention biased towards nearby steps

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use super::activation::sigmoid;
use super::linear::Linear;
use crate::error::{MlError, MlResult};
use crate::weights::WeightStore;

/// Query rows per score block, bounds the `[rows, keys]` score matrix
const QUERY_BLOCK: usize = 512;

#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    heads: usize,
    dim: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
}

impl MultiheadAttention {
    /// Split a packed `[3C, C]` in-projection into q/k/v
    pub fn new(
        in_proj_weight: Array2<f32>,
        in_proj_bias: ndarray::Array1<f32>,
        out_proj: Linear,
        heads: usize,
    ) -> MlResult<Self> {
        let dim = in_proj_weight.ncols();
        if heads == 0 || dim % heads != 0 || in_proj_weight.nrows() != 3 * dim {
            return Err(MlError::InvalidConfig(format!(
                "attention: dim {dim} with {heads} heads and in_proj {:?}",
                in_proj_weight.shape()
            )));
        }
        let part = |i: usize| {
            Linear::new(
                in_proj_weight.slice(s![i * dim..(i + 1) * dim, ..]).to_owned(),
                Some(in_proj_bias.slice(s![i * dim..(i + 1) * dim]).to_owned()),
            )
        };
        Ok(Self {
            heads,
            dim,
            q_proj: part(0),
            k_proj: part(1),
            v_proj: part(2),
            out_proj,
        })
    }

    pub fn load(store: &WeightStore, prefix: &str, dim: usize, heads: usize) -> MlResult<Self> {
        let in_proj_weight = store.array2(&format!("{prefix}.in_proj_weight"), [3 * dim, dim])?;
        let in_proj_bias = store.array1(&format!("{prefix}.in_proj_bias"), 3 * dim)?;
        let out_proj = Linear::load(store, &format!("{prefix}.out_proj"), dim, dim)?;
        Self::new(in_proj_weight, in_proj_bias, out_proj, heads)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `query [Nq, C]` attends over `key_value [Nk, C]`
    pub fn forward(&self, query: ArrayView2<f32>, key_value: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key_value)?;
        let v = self.v_proj.forward(key_value)?;

        let head_dim = self.dim / self.heads;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let per_head: Vec<Array2<f32>> = (0..self.heads)
            .into_par_iter()
            .map(|h| {
                let cols = h * head_dim..(h + 1) * head_dim;
                let qh = q.slice(s![.., cols.clone()]);
                let kh = k.slice(s![.., cols.clone()]);
                let vh = v.slice(s![.., cols]);
                let mut out = Array2::<f32>::zeros((qh.nrows(), head_dim));

                for start in (0..qh.nrows()).step_by(QUERY_BLOCK) {
                    let end = (start + QUERY_BLOCK).min(qh.nrows());
                    let mut scores = qh.slice(s![start..end, ..]).dot(&kh.t());
                    scores *= scale;
                    softmax_rows(&mut scores);
                    out.slice_mut(s![start..end, ..]).assign(&scores.dot(&vh));
                }
                out
            })
            .collect();

        let views: Vec<ArrayView2<f32>> = per_head.iter().map(|a| a.view()).collect();
        let merged = concatenate(Axis(1), &views)
            .map_err(|e| MlError::ProcessingFailed(format!("attention concat: {e}")))?;
        self.out_proj.forward(merged.view())
    }
}

/// Score given to a step attending to itself, which rules it out
const SELF_SCORE: f32 = -100.0;

/// Self-attention whose scores fall off linearly with the distance between
/// steps, at per-query rates predicted from the input. Steps never attend to
/// themselves and the result is added back to the input.
#[derive(Debug, Clone)]
pub struct LocalAttention {
    heads: usize,
    ndecay: usize,
    content: Linear,
    query: Linear,
    key: Linear,
    query_decay: Linear,
    proj: Linear,
}

impl LocalAttention {
    pub fn new(
        heads: usize,
        ndecay: usize,
        content: Linear,
        query: Linear,
        key: Linear,
        query_decay: Linear,
        proj: Linear,
    ) -> MlResult<Self> {
        let channels = content.out_features();
        if heads == 0 || channels % heads != 0 {
            return Err(MlError::InvalidConfig(format!(
                "local attention: {channels} channels with {heads} heads"
            )));
        }
        if query_decay.out_features() != heads * ndecay {
            return Err(MlError::InvalidConfig(format!(
                "local attention: {} decay outputs for {heads} heads x {ndecay}",
                query_decay.out_features()
            )));
        }
        Ok(Self {
            heads,
            ndecay,
            content,
            query,
            key,
            query_decay,
            proj,
        })
    }

    /// 1x1 convolutions `content`, `query`, `key`, `query_decay` and `proj` under `prefix`
    pub fn load(store: &WeightStore, prefix: &str, channels: usize, heads: usize, ndecay: usize) -> MlResult<Self> {
        let pointwise = |name: &str, out: usize| Linear::load_pointwise(store, &format!("{prefix}.{name}"), channels, out);
        Self::new(
            heads,
            ndecay,
            pointwise("content", channels)?,
            pointwise("query", channels)?,
            pointwise("key", channels)?,
            pointwise("query_decay", heads * ndecay)?,
            pointwise("proj", channels)?,
        )
    }

    /// `[T, C] -> [T, C]`
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let steps = x.nrows();
        let channels = self.content.out_features();
        let head_dim = channels / self.heads;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let decay_norm = 1.0 / (self.ndecay.max(1) as f32).sqrt();

        let queries = self.query.forward(x)?;
        let keys = self.key.forward(x)?;
        let content = self.content.forward(x)?;
        let mut decay = self.query_decay.forward(x)?;
        decay.mapv_inplace(|v| sigmoid(v) / 2.0);

        let per_head: Vec<Array2<f32>> = (0..self.heads)
            .into_par_iter()
            .map(|h| {
                let cols = h * head_dim..(h + 1) * head_dim;
                // rows are queries, columns keys
                let mut scores = queries.slice(s![.., cols.clone()]).dot(&keys.slice(s![.., cols.clone()]).t());
                scores *= scale;
                for (q, mut row) in scores.rows_mut().into_iter().enumerate() {
                    let rate = (0..self.ndecay)
                        .map(|f| (f + 1) as f32 * decay[[q, h * self.ndecay + f]])
                        .sum::<f32>()
                        * decay_norm;
                    for (k, v) in row.iter_mut().enumerate() {
                        *v -= rate * q.abs_diff(k) as f32;
                    }
                    row[q] = SELF_SCORE;
                }
                softmax_rows(&mut scores);
                scores.dot(&content.slice(s![.., cols]))
            })
            .collect();

        let views: Vec<ArrayView2<f32>> = per_head.iter().map(|a| a.view()).collect();
        let merged = concatenate(Axis(1), &views)
            .map_err(|e| MlError::ProcessingFailed(format!("local attention concat: {e}")))?;
        debug_assert_eq!(merged.dim(), (steps, channels));
        let mut out = self.proj.forward(merged.view())?;
        out += &x;
        Ok(out)
    }
}

/// Numerically stable softmax along each row
pub fn softmax_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    fn identity_attention(dim: usize, heads: usize) -> MultiheadAttention {
        let eye = Array2::<f32>::eye(dim);
        let mut packed = Array2::<f32>::zeros((3 * dim, dim));
        for i in 0..3 {
            packed.slice_mut(s![i * dim..(i + 1) * dim, ..]).assign(&eye);
        }
        let out = Linear::new(eye, Some(Array1::zeros(dim)));
        MultiheadAttention::new(packed, Array1::zeros(3 * dim), out, heads).unwrap()
    }

    #[test]
    fn test_softmax_rows() {
        let mut x = array![[0.0, 0.0], [1000.0, 0.0]];
        softmax_rows(&mut x);
        assert_abs_diff_eq!(x[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(x[[1, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x[[1, 1]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_single_key_returns_value() {
        let attn = identity_attention(4, 2);
        let query = array![[1.0, 0.0, 0.0, 1.0], [0.0, 2.0, 1.0, 0.0]];
        let kv = array![[0.5, -0.5, 2.0, 3.0]];

        let out = attn.forward(query.view(), kv.view()).unwrap();
        // softmax over one key is 1, so every query receives the value row
        for r in 0..2 {
            for c in 0..4 {
                assert_abs_diff_eq!(out[[r, c]], kv[[0, c]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_weighted_average_of_values() {
        let attn = identity_attention(2, 1);
        let query = array![[1.0, 0.0]];
        let kv = array![[1.0, 0.0], [0.0, 1.0]];

        let out = attn.forward(query.view(), kv.view()).unwrap();
        // scores [1, 0] / sqrt(2)
        let a = (1.0f32 / 2.0f32.sqrt()).exp();
        let w0 = a / (a + 1.0);
        assert_abs_diff_eq!(out[[0, 0]], w0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 1]], 1.0 - w0, epsilon = 1e-5);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let out = Linear::new(Array2::eye(6), None);
        let result = MultiheadAttention::new(Array2::zeros((18, 6)), Array1::zeros(18), out, 4);
        assert!(result.is_err());
    }

    fn local_attention(channels: usize, decay_bias: f32) -> LocalAttention {
        let eye = || Linear::new(Array2::eye(channels), Some(Array1::zeros(channels)));
        let zero = |out: usize| Linear::new(Array2::zeros((out, channels)), Some(Array1::zeros(out)));
        let decay = Linear::new(Array2::zeros((4, channels)), Some(Array1::from_elem(4, decay_bias)));
        LocalAttention::new(2, 2, eye(), zero(channels), zero(channels), decay, eye()).unwrap()
    }

    #[test]
    fn test_local_attention_skips_self() {
        // flat scores and no decay: each step averages the others
        let attn = local_attention(2, -50.0);
        let x = array![[1.0, 0.0], [0.0, 2.0], [3.0, 4.0]];
        let y = attn.forward(x.view()).unwrap();

        assert_abs_diff_eq!(y[[0, 0]], 1.0 + 1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(y[[0, 1]], 0.0 + 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y[[2, 1]], 4.0 + 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_local_attention_prefers_neighbours() {
        // decay rate 0.5 * (1 + 2) / sqrt(2) per step of distance
        let attn = local_attention(2, 50.0);
        let x = array![[1.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 1.0]];
        let y = attn.forward(x.view()).unwrap();

        // step 1 is next to step 0, step 3 next to step 4
        assert!(y[[1, 0]] > y[[1, 1]]);
        assert!(y[[3, 1]] > y[[3, 0]]);
        // step 2 is equally far from both ends
        assert_abs_diff_eq!(y[[2, 0]], y[[2, 1]], epsilon = 1e-6);
    }

    #[test]
    fn test_local_attention_rejects_bad_decay_width() {
        let eye = || Linear::new(Array2::eye(4), None);
        let decay = Linear::new(Array2::zeros((3, 4)), None);
        assert!(LocalAttention::new(2, 2, eye(), eye(), eye(), decay, eye()).is_err());
    }
}
