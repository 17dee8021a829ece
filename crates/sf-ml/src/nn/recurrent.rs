//! Bidirectional LSTM over `[T, C]` token matrices (`nn.LSTM` weight layout)

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use super::activation::sigmoid;
use super::linear::Linear;
use crate::error::{MlError, MlResult};
use crate::weights::WeightStore;

/// One direction of one LSTM layer
#[derive(Debug, Clone)]
struct LstmCell {
    hidden: usize,
    /// Input projection with both biases folded in, gates in `i, f, g, o` order
    input: Linear,
    /// `[H, 4H]`
    recurrent_t: Array2<f32>,
}

impl LstmCell {
    fn load(store: &WeightStore, prefix: &str, layer: usize, suffix: &str, input: usize, hidden: usize) -> MlResult<Self> {
        let name = |what: &str| format!("{prefix}.{what}_l{layer}{suffix}");
        let w_ih = store.array2(&name("weight_ih"), [4 * hidden, input])?;
        let w_hh = store.array2(&name("weight_hh"), [4 * hidden, hidden])?;
        let bias = store.array1(&name("bias_ih"), 4 * hidden)? + &store.array1(&name("bias_hh"), 4 * hidden)?;
        Ok(Self {
            hidden,
            input: Linear::new(w_ih, Some(bias)),
            recurrent_t: w_hh.reversed_axes().as_standard_layout().into_owned(),
        })
    }

    /// `[T, in] -> [T, H]`, scanning from the end when `reverse`
    fn forward(&self, x: ArrayView2<f32>, reverse: bool) -> MlResult<Array2<f32>> {
        let steps = x.nrows();
        let hs = self.hidden;
        let projected = self.input.forward(x)?;

        let mut out = Array2::<f32>::zeros((steps, hs));
        let mut h = Array1::<f32>::zeros(hs);
        let mut c = Array1::<f32>::zeros(hs);

        for i in 0..steps {
            let t = if reverse { steps - 1 - i } else { i };
            let mut gates = h.dot(&self.recurrent_t);
            gates += &projected.row(t);
            for j in 0..hs {
                let input_gate = sigmoid(gates[j]);
                let forget_gate = sigmoid(gates[hs + j]);
                let cell = gates[2 * hs + j].tanh();
                let output_gate = sigmoid(gates[3 * hs + j]);
                c[j] = forget_gate * c[j] + input_gate * cell;
                h[j] = output_gate * c[j].tanh();
            }
            out.row_mut(t).assign(&h);
        }
        Ok(out)
    }
}

/// Stacked bidirectional LSTM; each layer sees both directions of the previous one
#[derive(Debug, Clone)]
pub struct BiLstm {
    layers: Vec<(LstmCell, LstmCell)>,
    hidden: usize,
}

impl BiLstm {
    pub fn load(store: &WeightStore, prefix: &str, input: usize, hidden: usize, layers: usize) -> MlResult<Self> {
        let layers = (0..layers)
            .map(|layer| {
                let width = if layer == 0 { input } else { 2 * hidden };
                Ok((
                    LstmCell::load(store, prefix, layer, "", width, hidden)?,
                    LstmCell::load(store, prefix, layer, "_reverse", width, hidden)?,
                ))
            })
            .collect::<MlResult<Vec<_>>>()?;
        Ok(Self { layers, hidden })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// `[T, in] -> [T, 2H]`, forward direction first
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let mut y = x.to_owned();
        for (forward, backward) in &self.layers {
            let (a, b) = rayon::join(|| forward.forward(y.view(), false), || backward.forward(y.view(), true));
            let (a, b) = (a?, b?);
            y = concatenate(Axis(1), &[a.view(), b.view()])
                .map_err(|e| MlError::ProcessingFailed(format!("lstm concat: {e}")))?;
        }
        Ok(y)
    }
}

/// Residual BiLSTM with a `2C -> C` projection back to the input width.
///
/// Sequences longer than `max_steps` run as windows of `max_steps` with a
/// hop of half a window. Each window keeps its central half; the first and
/// last windows also keep their outer quarter.
#[derive(Debug, Clone)]
pub struct ResidualBiLstm {
    lstm: BiLstm,
    linear: Linear,
    max_steps: usize,
}

impl ResidualBiLstm {
    /// `{prefix}.lstm` and `{prefix}.linear`
    pub fn load(store: &WeightStore, prefix: &str, dim: usize, layers: usize, max_steps: usize) -> MlResult<Self> {
        if max_steps < 4 {
            return Err(MlError::InvalidConfig(format!("LSTM window of {max_steps} steps is too short")));
        }
        Ok(Self {
            lstm: BiLstm::load(store, &format!("{prefix}.lstm"), dim, dim, layers)?,
            linear: Linear::load(store, &format!("{prefix}.linear"), 2 * dim, dim)?,
            max_steps,
        })
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let mut y = if x.nrows() > self.max_steps {
            self.forward_windows(x)?
        } else {
            self.project(x)?
        };
        y += &x;
        Ok(y)
    }

    fn project(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        self.linear.forward(self.lstm.forward(x)?.view())
    }

    fn forward_windows(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let (steps, dim) = x.dim();
        let width = self.max_steps;
        let hop = width / 2;
        let limit = hop / 2;
        let windows = steps.div_ceil(hop);

        let mut padded = Array2::<f32>::zeros(((windows - 1) * hop + width, dim));
        padded.slice_mut(s![..steps, ..]).assign(&x);

        let outputs = (0..windows)
            .into_par_iter()
            .map(|k| self.project(padded.slice(s![k * hop..k * hop + width, ..])))
            .collect::<MlResult<Vec<_>>>()?;

        let mut out = Array2::<f32>::zeros((steps, dim));
        let mut pos = 0;
        for (k, window) in outputs.iter().enumerate() {
            let lo = if k == 0 { 0 } else { limit };
            let hi = if k + 1 == windows { width } else { width - limit };
            let take = (hi - lo).min(steps - pos);
            out.slice_mut(s![pos..pos + take, ..])
                .assign(&window.slice(s![lo..lo + take, ..]));
            pos += take;
            if pos == steps {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{push_bilstm, push_linear, ParamInit, ParamSpec};
    use approx::assert_abs_diff_eq;

    fn store(dim: usize, layers: usize, seed: u64) -> WeightStore {
        let mut specs = Vec::new();
        push_bilstm(&mut specs, "blstm.lstm", dim, dim, layers);
        push_linear(&mut specs, "blstm.linear", 2 * dim, dim);
        WeightStore::random(&specs, seed)
    }

    fn tokens(steps: usize, dim: usize) -> Array2<f32> {
        Array2::from_shape_fn((steps, dim), |(t, c)| ((t * 3 + c) as f32 * 0.17).sin())
    }

    #[test]
    fn test_single_step_cell() {
        // H = 1, zero recurrence: gates are the input projection only
        let specs = [
            ParamSpec::new("l.weight_ih_l0", &[4, 1], ParamInit::Ones),
            ParamSpec::new("l.weight_hh_l0", &[4, 1], ParamInit::Zeros),
            ParamSpec::new("l.bias_ih_l0", &[4], ParamInit::Zeros),
            ParamSpec::new("l.bias_hh_l0", &[4], ParamInit::Zeros),
        ];
        let cell = LstmCell::load(&WeightStore::random(&specs, 0), "l", 0, "", 1, 1).unwrap();
        let y = cell.forward(ndarray::array![[1.0f32]].view(), false).unwrap();

        let s = sigmoid(1.0);
        let c = s * 1.0f32.tanh();
        assert_abs_diff_eq!(y[[0, 0]], s * c.tanh(), epsilon = 1e-6);
    }

    #[test]
    fn test_directions_are_mirrored() {
        let store = store(3, 1, 4);
        let lstm = BiLstm::load(&store, "blstm.lstm", 3, 3, 1).unwrap();
        let x = tokens(9, 3);
        let y = lstm.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (9, 6));

        // the backward half is the forward scan of the reversed sequence
        let (_, backward) = &lstm.layers[0];
        let reversed = x.slice(s![..;-1, ..]).to_owned();
        let scanned = backward.forward(reversed.view(), false).unwrap();
        for t in 0..9 {
            for c in 0..3 {
                assert_abs_diff_eq!(y[[t, 3 + c]], scanned[[8 - t, c]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_stacked_layers_shape() {
        let store = store(4, 2, 1);
        let lstm = BiLstm::load(&store, "blstm.lstm", 4, 4, 2).unwrap();
        let y = lstm.forward(tokens(5, 4).view()).unwrap();
        assert_eq!(y.dim(), (5, 8));
        assert!(y.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_short_sequences_run_whole() {
        let store = store(4, 2, 2);
        let block = ResidualBiLstm::load(&store, "blstm", 4, 2, 16).unwrap();
        let x = tokens(16, 4);
        let y = block.forward(x.view()).unwrap();
        let expected = block.project(x.view()).unwrap() + &x;
        assert_eq!(y, expected);
    }

    #[test]
    fn test_long_sequences_stitch_window_centres() {
        let store = store(4, 2, 3);
        let block = ResidualBiLstm::load(&store, "blstm", 4, 2, 8).unwrap();
        let x = tokens(21, 4);
        let y = block.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (21, 4));

        // window 0 covers 0..8 and keeps 0..6
        let first = block.project(x.slice(s![0..8, ..])).unwrap();
        for t in 0..6 {
            assert_abs_diff_eq!(y[[t, 1]], first[[t, 1]] + x[[t, 1]], epsilon = 1e-6);
        }
        // window 2 covers 8..16 and keeps 10..14
        let third = block.project(x.slice(s![8..16, ..])).unwrap();
        for t in 10..14 {
            assert_abs_diff_eq!(y[[t, 2]], third[[t - 8, 2]] + x[[t, 2]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rejects_tiny_window() {
        let store = store(4, 1, 0);
        assert!(ResidualBiLstm::load(&store, "blstm", 4, 1, 2).is_err());
    }
}
