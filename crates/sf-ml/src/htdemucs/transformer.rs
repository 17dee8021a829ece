//! Cross-domain transformer between the spectral and waveform bottlenecks
//!
//! ```text
//!   x  [C, Fr, T1] ──tokens (t1 fr)──► norm_in  + 2D sin ──┐
//!                                                           ├─► layers (self / cross, alternating)
//!   xt [C, 1, T2]  ──tokens t2──────► norm_in_t + 1D sin ──┘
//! ```
//!
//! Cross layers let each branch attend to the other branch's tokens as
//! they were before the layer.

use ndarray::{Array2, Array3, ArrayView2};

use crate::error::{MlError, MlResult};
use crate::nn::{gelu, GroupNorm, LayerNorm, LayerScale, Linear, MultiheadAttention};
use crate::weights::WeightStore;

use super::config::HTDemucsConfig;

/// 1D embedding `[length, dim]`: `cat(cos(phase), sin(phase))`
/// with `phase = pos / max_period^(i / (dim/2 - 1))`
pub fn sin_embedding(length: usize, dim: usize, max_period: f32) -> Array2<f32> {
    let half = dim / 2;
    let denom = (half.max(2) - 1) as f64;
    Array2::from_shape_fn((length, dim), |(pos, c)| {
        let i = c % half;
        let phase = pos as f64 / (max_period as f64).powf(i as f64 / denom);
        if c < half { phase.cos() as f32 } else { phase.sin() as f32 }
    })
}

/// 2D embedding in token layout `[T * Fr, dim]`, token `t * Fr + f`.
///
/// The first half of the channels encodes the time index, the second half
/// the frequency index, interleaving sin (even) and cos (odd).
pub fn sin_embedding_2d(dim: usize, freqs: usize, frames: usize, max_period: f32) -> Array2<f32> {
    let half = dim / 2;
    let log_period = (max_period as f64).ln();
    Array2::from_shape_fn((frames * freqs, dim), |(token, c)| {
        let t = (token / freqs) as f64;
        let f = (token % freqs) as f64;
        let (pos, c) = if c < half { (t, c) } else { (f, c - half) };
        let div = ((c / 2 * 2) as f64 * -(log_period / half as f64)).exp();
        let arg = pos * div;
        if c % 2 == 0 { arg.sin() as f32 } else { arg.cos() as f32 }
    })
}

/// Attention sub-layer flavour
#[derive(Debug, Clone)]
enum Attention {
    SelfAttn,
    Cross { norm_kv: LayerNorm },
}

/// Norm-first transformer layer with LayerScale and GroupNorm(1) out
#[derive(Debug, Clone)]
struct TransformerLayer {
    kind: Attention,
    attn: MultiheadAttention,
    norm1: LayerNorm,
    norm_ff: LayerNorm,
    linear1: Linear,
    linear2: Linear,
    gamma_1: Option<LayerScale>,
    gamma_2: Option<LayerScale>,
    norm_out: Option<GroupNorm>,
}

impl TransformerLayer {
    fn load(store: &WeightStore, prefix: &str, cross: bool, cfg: &HTDemucsConfig) -> MlResult<Self> {
        let dim = cfg.transformer_dim();
        let hidden = cfg.transformer_hidden();
        let attn_name = if cross { "cross_attn" } else { "self_attn" };

        let (kind, norm_ff) = if cross {
            (
                Attention::Cross {
                    norm_kv: LayerNorm::load(store, &format!("{prefix}.norm2"), dim)?,
                },
                LayerNorm::load(store, &format!("{prefix}.norm3"), dim)?,
            )
        } else {
            (Attention::SelfAttn, LayerNorm::load(store, &format!("{prefix}.norm2"), dim)?)
        };

        let gamma = |name: &str| -> MlResult<Option<LayerScale>> {
            cfg.t_layer_scale
                .then(|| LayerScale::load(store, &format!("{prefix}.{name}"), dim))
                .transpose()
        };

        Ok(Self {
            kind,
            attn: MultiheadAttention::load(store, &format!("{prefix}.{attn_name}"), dim, cfg.t_heads)?,
            norm1: LayerNorm::load(store, &format!("{prefix}.norm1"), dim)?,
            norm_ff,
            linear1: Linear::load(store, &format!("{prefix}.linear1"), dim, hidden)?,
            linear2: Linear::load(store, &format!("{prefix}.linear2"), hidden, dim)?,
            gamma_1: gamma("gamma_1")?,
            gamma_2: gamma("gamma_2")?,
            norm_out: cfg
                .t_norm_out
                .then(|| GroupNorm::load(store, &format!("{prefix}.norm_out"), 1, dim))
                .transpose()?,
        })
    }

    /// `other` is required by cross layers and ignored by self-attention layers
    fn forward(&self, x: &Array2<f32>, other: Option<ArrayView2<f32>>) -> MlResult<Array2<f32>> {
        let q = self.norm1.forward(x);
        let mut update = match &self.kind {
            Attention::SelfAttn => self.attn.forward(q.view(), q.view())?,
            Attention::Cross { norm_kv } => {
                let other = other.ok_or_else(|| {
                    MlError::InferenceFailed {
                        reason: "cross-attention layer called without key tokens".into(),
                    }
                })?;
                let kv = norm_kv.forward(&other.to_owned());
                self.attn.forward(q.view(), kv.view())?
            }
        };
        if let Some(g) = &self.gamma_1 {
            g.apply_tokens(&mut update);
        }
        let mut x = x + &update;

        let mut hidden = self.linear1.forward(self.norm_ff.forward(&x).view())?;
        gelu(&mut hidden);
        let mut update = self.linear2.forward(hidden.view())?;
        if let Some(g) = &self.gamma_2 {
            g.apply_tokens(&mut update);
        }
        x += &update;

        if let Some(norm) = &self.norm_out {
            norm.forward_tokens(&mut x);
        }
        Ok(x)
    }

    fn is_cross(&self) -> bool {
        matches!(self.kind, Attention::Cross { .. })
    }
}

/// Two parallel stacks (`layers` for frequency tokens, `layers_t` for time tokens)
#[derive(Debug, Clone)]
pub struct CrossTransformerEncoder {
    dim: usize,
    max_period: f32,
    weight_pos_embed: f32,
    norm_in: Option<LayerNorm>,
    norm_in_t: Option<LayerNorm>,
    layers: Vec<(TransformerLayer, TransformerLayer)>,
}

impl CrossTransformerEncoder {
    pub fn load(store: &WeightStore, cfg: &HTDemucsConfig) -> MlResult<Self> {
        let dim = cfg.transformer_dim();
        let (norm_in, norm_in_t) = if cfg.t_norm_in {
            (
                Some(LayerNorm::load(store, "crosstransformer.norm_in", dim)?),
                Some(LayerNorm::load(store, "crosstransformer.norm_in_t", dim)?),
            )
        } else {
            (None, None)
        };

        let layers = (0..cfg.t_layers)
            .map(|idx| {
                let cross = cfg.is_cross_layer(idx);
                Ok((
                    TransformerLayer::load(store, &format!("crosstransformer.layers.{idx}"), cross, cfg)?,
                    TransformerLayer::load(store, &format!("crosstransformer.layers_t.{idx}"), cross, cfg)?,
                ))
            })
            .collect::<MlResult<Vec<_>>>()?;

        Ok(Self {
            dim,
            max_period: cfg.t_max_period,
            weight_pos_embed: cfg.t_weight_pos_embed,
            norm_in,
            norm_in_t,
            layers,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// `x [C, Fr, T1]`, `xt [C, 1, T2]`, both with `C` = model width
    pub fn forward(&self, x: Array3<f32>, xt: Array3<f32>) -> MlResult<(Array3<f32>, Array3<f32>)> {
        let (c, freqs, frames) = x.dim();
        let (ct, _, samples) = xt.dim();
        if c != self.dim || ct != self.dim {
            return Err(MlError::ChannelMismatch {
                expected: self.dim,
                got: if c != self.dim { c } else { ct },
            });
        }

        // [C, Fr, T1] -> [T1 * Fr, C]
        let mut tokens = to_shape2(x.permuted_axes([2, 1, 0]), (frames * freqs, c))?;
        if let Some(norm) = &self.norm_in {
            tokens = norm.forward(&tokens);
        }
        tokens.scaled_add(
            self.weight_pos_embed,
            &sin_embedding_2d(c, freqs, frames, self.max_period),
        );

        let mut tokens_t = to_shape2(xt.permuted_axes([2, 1, 0]), (samples, c))?;
        if let Some(norm) = &self.norm_in_t {
            tokens_t = norm.forward(&tokens_t);
        }
        tokens_t.scaled_add(self.weight_pos_embed, &sin_embedding(samples, c, self.max_period));

        for (layer, layer_t) in &self.layers {
            if layer.is_cross() {
                let old = tokens;
                tokens = layer.forward(&old, Some(tokens_t.view()))?;
                tokens_t = layer_t.forward(&tokens_t, Some(old.view()))?;
            } else {
                tokens = layer.forward(&tokens, None)?;
                tokens_t = layer_t.forward(&tokens_t, None)?;
            }
        }

        let x = tokens
            .into_shape_with_order((frames, freqs, c))
            .map_err(|e| MlError::ProcessingFailed(format!("transformer output: {e}")))?
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned();
        let xt = tokens_t
            .into_shape_with_order((samples, 1, c))
            .map_err(|e| MlError::ProcessingFailed(format!("transformer output: {e}")))?
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned();
        Ok((x, xt))
    }
}

fn to_shape2(x: Array3<f32>, shape: (usize, usize)) -> MlResult<Array2<f32>> {
    x.as_standard_layout()
        .into_owned()
        .into_shape_with_order(shape)
        .map_err(|e| MlError::ProcessingFailed(format!("token layout: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sin_embedding_closed_form() {
        let emb = sin_embedding(5, 8, 10000.0);
        assert_eq!(emb.dim(), (5, 8));
        // position 0: cos = 1, sin = 0
        for c in 0..4 {
            assert_abs_diff_eq!(emb[[0, c]], 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(emb[[0, c + 4]], 0.0, epsilon = 1e-6);
        }
        // channel 0 has period 2*pi, the last one max_period
        assert_abs_diff_eq!(emb[[3, 0]], 3.0f32.cos(), epsilon = 1e-6);
        assert_abs_diff_eq!(emb[[3, 7]], (3.0f32 / 10000.0).sin(), epsilon = 1e-6);
    }

    #[test]
    fn test_sin_embedding_2d_closed_form() {
        let (dim, freqs, frames) = (8, 3, 4);
        let emb = sin_embedding_2d(dim, freqs, frames, 10000.0);
        assert_eq!(emb.dim(), (12, 8));

        let token = |t: usize, f: usize| t * freqs + f;
        let div1 = (2.0f32 * -(10000.0f32.ln() / 4.0)).exp();
        // time channels
        assert_abs_diff_eq!(emb[[token(2, 1), 0]], 2.0f32.sin(), epsilon = 1e-6);
        assert_abs_diff_eq!(emb[[token(2, 1), 1]], 2.0f32.cos(), epsilon = 1e-6);
        assert_abs_diff_eq!(emb[[token(3, 0), 2]], (3.0 * div1).sin(), epsilon = 1e-6);
        // frequency channels
        assert_abs_diff_eq!(emb[[token(0, 2), 4]], 2.0f32.sin(), epsilon = 1e-6);
        assert_abs_diff_eq!(emb[[token(1, 2), 7]], (2.0 * div1).cos(), epsilon = 1e-6);
    }

    #[test]
    fn test_transformer_shapes_and_alternation() {
        let cfg = HTDemucsConfig::tiny();
        let store = cfg.random_weights(11);
        let transformer = CrossTransformerEncoder::load(&store, &cfg).unwrap();
        assert_eq!(transformer.num_layers(), 2);
        assert!(!transformer.layers[0].0.is_cross());
        assert!(transformer.layers[1].0.is_cross());

        let dim = cfg.transformer_dim();
        let x = Array3::from_shape_fn((dim, 16, 9), |(c, f, t)| ((c + 2 * f + 3 * t) as f32 * 0.01).sin());
        let xt = Array3::from_shape_fn((dim, 1, 63), |(c, _, t)| ((c * t) as f32 * 0.001).cos());
        let (y, yt) = transformer.forward(x, xt).unwrap();
        assert_eq!(y.dim(), (dim, 16, 9));
        assert_eq!(yt.dim(), (dim, 1, 63));
        assert!(y.iter().chain(yt.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn test_transformer_rejects_wrong_width() {
        let cfg = HTDemucsConfig::tiny();
        let store = cfg.random_weights(11);
        let transformer = CrossTransformerEncoder::load(&store, &cfg).unwrap();
        let x = Array3::zeros((3, 4, 4));
        let xt = Array3::zeros((3, 1, 4));
        assert!(transformer.forward(x, xt).is_err());
    }
}
