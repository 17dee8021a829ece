//! Named parameter storage backed by safetensors files.
//!
//! Tensors are converted to `f32` on load (F32, F16 and BF16 are accepted)
//! and handed out as `ndarray` arrays after their shape has been checked
//! against what the architecture expects.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::{Array1, Array2, Array3, Array4, ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::error::{MlError, MlResult};

/// A single stored tensor
#[derive(Debug, Clone)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// How a parameter is initialised when building synthetic weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamInit {
    /// Uniform in `[-bound, bound]`
    Uniform(f32),
    /// All ones (norm weights)
    Ones,
    /// All zeros (norm biases)
    Zeros,
    /// Constant value (layer scales)
    Constant(f32),
}

/// Name, shape and initialiser of one model parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: ParamInit,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], init: ParamInit) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            init,
        }
    }

    /// Number of scalar values
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

pub(crate) fn push_conv(specs: &mut Vec<ParamSpec>, prefix: &str, shape: &[usize]) {
    let fan_in: usize = shape[1..].iter().product();
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    specs.push(ParamSpec::new(format!("{prefix}.weight"), shape, ParamInit::Uniform(bound)));
    specs.push(ParamSpec::new(format!("{prefix}.bias"), &[shape[0]], ParamInit::Uniform(bound)));
}

/// Transposed convolutions store `[in, out, ...]`
pub(crate) fn push_conv_tr(specs: &mut Vec<ParamSpec>, prefix: &str, shape: &[usize]) {
    let fan_in: usize = shape[1..].iter().product();
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    specs.push(ParamSpec::new(format!("{prefix}.weight"), shape, ParamInit::Uniform(bound)));
    specs.push(ParamSpec::new(format!("{prefix}.bias"), &[shape[1]], ParamInit::Uniform(bound)));
}

pub(crate) fn push_linear(specs: &mut Vec<ParamSpec>, prefix: &str, input: usize, output: usize) {
    let bound = 1.0 / (input.max(1) as f32).sqrt();
    specs.push(ParamSpec::new(format!("{prefix}.weight"), &[output, input], ParamInit::Uniform(bound)));
    specs.push(ParamSpec::new(format!("{prefix}.bias"), &[output], ParamInit::Uniform(bound)));
}

pub(crate) fn push_norm(specs: &mut Vec<ParamSpec>, prefix: &str, channels: usize) {
    specs.push(ParamSpec::new(format!("{prefix}.weight"), &[channels], ParamInit::Ones));
    specs.push(ParamSpec::new(format!("{prefix}.bias"), &[channels], ParamInit::Zeros));
}

/// `nn.LSTM(bidirectional=True)` parameters, `_reverse` for the backward direction
pub(crate) fn push_bilstm(specs: &mut Vec<ParamSpec>, prefix: &str, input: usize, hidden: usize, layers: usize) {
    let bound = 1.0 / (hidden.max(1) as f32).sqrt();
    for layer in 0..layers {
        let width = if layer == 0 { input } else { 2 * hidden };
        for suffix in ["", "_reverse"] {
            let shapes = [
                ("weight_ih", vec![4 * hidden, width]),
                ("weight_hh", vec![4 * hidden, hidden]),
                ("bias_ih", vec![4 * hidden]),
                ("bias_hh", vec![4 * hidden]),
            ];
            for (name, shape) in shapes {
                specs.push(ParamSpec::new(
                    format!("{prefix}.{name}_l{layer}{suffix}"),
                    &shape,
                    ParamInit::Uniform(bound),
                ));
            }
        }
    }
}

/// In-memory weight store
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, StoredTensor>,
}

impl WeightStore {
    /// Read a safetensors file from disk
    pub fn open(path: impl AsRef<Path>) -> MlResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MlError::ModelNotFound {
                path: path.display().to_string(),
            });
        }
        let data = std::fs::read(path)?;
        let store = Self::from_bytes(&data)?;
        log::debug!("Loaded {} tensors from {}", store.len(), path.display());
        Ok(store)
    }

    /// Parse a safetensors buffer
    pub fn from_bytes(data: &[u8]) -> MlResult<Self> {
        let tensors = SafeTensors::deserialize(data)?;
        let mut out = HashMap::new();

        for (name, view) in tensors.tensors() {
            let shape = view.shape().to_vec();
            let data = decode_f32(&name, view.dtype(), view.data())?;
            out.insert(name, StoredTensor { shape, data });
        }

        Ok(Self { tensors: out })
    }

    /// Build a store from already decoded tensors
    pub fn from_tensors<I>(tensors: I) -> MlResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<usize>, Vec<f32>)>,
    {
        let mut out = HashMap::new();
        for (name, shape, data) in tensors {
            let numel: usize = shape.iter().product();
            if numel != data.len() {
                return Err(MlError::ShapeMismatch {
                    name,
                    expected: shape,
                    got: vec![data.len()],
                });
            }
            out.insert(name, StoredTensor { shape, data });
        }
        Ok(Self { tensors: out })
    }

    /// Deterministic random parameters for the given specs.
    ///
    /// Used for smoke tests and benchmarks where no trained checkpoint is
    /// available; the distributions mirror PyTorch's default initialisers.
    pub fn random(specs: &[ParamSpec], seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut tensors = HashMap::with_capacity(specs.len());

        for spec in specs {
            let numel = spec.numel();
            let data: Vec<f32> = match spec.init {
                ParamInit::Uniform(bound) if bound > 0.0 => {
                    (0..numel).map(|_| rng.random_range(-bound..=bound)).collect()
                }
                ParamInit::Uniform(_) | ParamInit::Zeros => vec![0.0; numel],
                ParamInit::Ones => vec![1.0; numel],
                ParamInit::Constant(v) => vec![v; numel],
            };
            tensors.insert(
                spec.name.clone(),
                StoredTensor {
                    shape: spec.shape.clone(),
                    data,
                },
            );
        }

        Self { tensors }
    }

    /// Keep only tensors under `prefix`, with the prefix removed.
    ///
    /// Bags of models stored in a single file use `"0."`, `"1."`, ... prefixes.
    pub fn strip_prefix(&self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .iter()
            .filter_map(|(name, t)| {
                name.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), t.clone()))
            })
            .collect();
        Self { tensors }
    }

    /// Write all tensors to a safetensors file (F32, sorted by name)
    pub fn save(&self, path: impl AsRef<Path>) -> MlResult<()> {
        let sorted: BTreeMap<&String, &StoredTensor> = self.tensors.iter().collect();
        let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = sorted
            .into_iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    t.shape.clone(),
                    bytemuck::cast_slice::<f32, u8>(&t.data).to_vec(),
                )
            })
            .collect();

        let mut views = Vec::with_capacity(bytes.len());
        for (name, shape, data) in &bytes {
            views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?));
        }

        safetensors::serialize_to_file(views.iter().map(|(n, v)| (*n, v)), &None, path.as_ref())?;
        Ok(())
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Shape of a tensor, if present
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// All tensor names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.data.len()).sum()
    }

    /// Check every spec is present with the right shape
    pub fn validate(&self, specs: &[ParamSpec]) -> MlResult<()> {
        for spec in specs {
            self.checked(&spec.name, &spec.shape)?;
        }
        Ok(())
    }

    /// Names present in the store but not in `specs`
    pub fn unused(&self, specs: &[ParamSpec]) -> Vec<String> {
        let mut unused: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| !specs.iter().any(|s| &s.name == *name))
            .cloned()
            .collect();
        unused.sort_unstable();
        unused
    }

    fn checked(&self, name: &str, expected: &[usize]) -> MlResult<&StoredTensor> {
        let tensor = self.tensors.get(name).ok_or_else(|| MlError::MissingTensor {
            name: name.to_string(),
        })?;
        if tensor.shape != expected {
            return Err(MlError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                got: tensor.shape.clone(),
            });
        }
        Ok(tensor)
    }

    /// Fetch a tensor of any rank
    pub fn tensor(&self, name: &str, shape: &[usize]) -> MlResult<ArrayD<f32>> {
        let t = self.checked(name, shape)?;
        ArrayD::from_shape_vec(IxDyn(shape), t.data.clone())
            .map_err(|e| MlError::ProcessingFailed(format!("{name}: {e}")))
    }

    pub fn array1(&self, name: &str, len: usize) -> MlResult<Array1<f32>> {
        let t = self.checked(name, &[len])?;
        Ok(Array1::from_vec(t.data.clone()))
    }

    pub fn array2(&self, name: &str, shape: [usize; 2]) -> MlResult<Array2<f32>> {
        let t = self.checked(name, &shape)?;
        Array2::from_shape_vec((shape[0], shape[1]), t.data.clone())
            .map_err(|e| MlError::ProcessingFailed(format!("{name}: {e}")))
    }

    pub fn array3(&self, name: &str, shape: [usize; 3]) -> MlResult<Array3<f32>> {
        let t = self.checked(name, &shape)?;
        Array3::from_shape_vec((shape[0], shape[1], shape[2]), t.data.clone())
            .map_err(|e| MlError::ProcessingFailed(format!("{name}: {e}")))
    }

    pub fn array4(&self, name: &str, shape: [usize; 4]) -> MlResult<Array4<f32>> {
        let t = self.checked(name, &shape)?;
        Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), t.data.clone())
            .map_err(|e| MlError::ProcessingFailed(format!("{name}: {e}")))
    }
}

/// Convert raw little-endian tensor bytes to f32
fn decode_f32(name: &str, dtype: Dtype, data: &[u8]) -> MlResult<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(match bytemuck::try_cast_slice::<u8, f32>(data) {
            Ok(aligned) => aligned.to_vec(),
            // mmap offsets are not always 4-byte aligned
            Err(_) => data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        }),
        Dtype::F16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        Dtype::F64 => Ok(data
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        other => Err(MlError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{other:?}"),
        }),
    }
}
