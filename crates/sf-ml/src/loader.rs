//! Model loading: extension dispatch, config sidecars and bag manifests
//!
//! | file                 | model                                           |
//! |----------------------|-------------------------------------------------|
//! | `*.safetensors`      | native HTDemucs / HDemucs (`<stem>.json` sidecar optional) |
//! | `*.onnx`             | tract ONNX graph (`<stem>.json` sidecar optional) |
//! | `*.json` (manifest)  | bag of models, members relative to the manifest  |

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{MlError, MlResult};
use crate::hdemucs::{HDemucs, HDemucsConfig};
use crate::htdemucs::{HTDemucs, HTDemucsConfig};
use crate::registry;
use crate::separation::{BagManifest, BagOfModels, OnnxDemucs, SeparationModel, StemType};
use crate::weights::{ParamSpec, WeightStore};

/// Sidecar key selecting the architecture, `htdemucs` when absent
const ARCHITECTURE_KEY: &str = "architecture";

/// Architecture of a native weight file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "architecture")]
pub enum NativeConfig {
    /// Hybrid Transformer Demucs (v4)
    #[serde(rename = "htdemucs")]
    HTDemucs(HTDemucsConfig),
    /// Hybrid Demucs (v3)
    #[serde(rename = "hdemucs")]
    HDemucs(HDemucsConfig),
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self::HTDemucs(HTDemucsConfig::default())
    }
}

impl NativeConfig {
    /// Parse a sidecar, dispatching on its `architecture` key
    pub fn from_json(text: &str) -> MlResult<Self> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        let architecture = match value.as_object_mut().and_then(|o| o.remove(ARCHITECTURE_KEY)) {
            Some(serde_json::Value::String(name)) => name,
            Some(other) => {
                return Err(MlError::InvalidConfig(format!("architecture must be a string, got {other}")));
            }
            None => "htdemucs".to_string(),
        };
        match architecture.as_str() {
            "htdemucs" => Ok(Self::HTDemucs(serde_json::from_value(value)?)),
            "hdemucs" => Ok(Self::HDemucs(serde_json::from_value(value)?)),
            other => Err(MlError::InvalidConfig(format!("unknown architecture '{other}'"))),
        }
    }

    pub fn architecture(&self) -> &'static str {
        match self {
            Self::HTDemucs(_) => "htdemucs",
            Self::HDemucs(_) => "hdemucs",
        }
    }

    pub fn sources(&self) -> &[StemType] {
        match self {
            Self::HTDemucs(c) => &c.sources,
            Self::HDemucs(c) => &c.sources,
        }
    }

    pub fn samplerate(&self) -> u32 {
        match self {
            Self::HTDemucs(c) => c.samplerate,
            Self::HDemucs(c) => c.samplerate,
        }
    }

    pub fn audio_channels(&self) -> usize {
        match self {
            Self::HTDemucs(c) => c.audio_channels,
            Self::HDemucs(c) => c.audio_channels,
        }
    }

    /// Inference window in seconds
    pub fn segment(&self) -> f32 {
        match self {
            Self::HTDemucs(c) => c.segment,
            Self::HDemucs(c) => c.segment,
        }
    }

    pub fn set_segment(&mut self, segment: f32) {
        match self {
            Self::HTDemucs(c) => c.segment = segment,
            Self::HDemucs(c) => c.segment = segment,
        }
    }

    pub fn training_length(&self) -> usize {
        match self {
            Self::HTDemucs(c) => c.training_length(),
            Self::HDemucs(c) => c.training_length(),
        }
    }

    pub fn validate(&self) -> MlResult<()> {
        match self {
            Self::HTDemucs(c) => c.validate(),
            Self::HDemucs(c) => c.validate(),
        }
    }

    pub fn parameter_specs(&self) -> Vec<ParamSpec> {
        match self {
            Self::HTDemucs(c) => c.parameter_specs(),
            Self::HDemucs(c) => c.parameter_specs(),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_specs().iter().map(ParamSpec::numel).sum()
    }

    /// Recover the architecture from tensor shapes.
    ///
    /// Checkpoints with fewer waveform than spectral encoders merge the
    /// branches and are v3; `base` only contributes when it is the same
    /// architecture.
    pub fn infer(store: &WeightStore, base: &NativeConfig) -> MlResult<Self> {
        let count = |prefix: &str| {
            (0..)
                .take_while(|i| store.contains(&format!("{prefix}.{i}.conv.weight")))
                .count()
        };
        let merged = count("tencoder") < count("encoder");
        match (merged, base) {
            (false, Self::HTDemucs(base)) => HTDemucsConfig::infer(store, base).map(Self::HTDemucs),
            (false, Self::HDemucs(_)) => HTDemucsConfig::infer(store, &HTDemucsConfig::default()).map(Self::HTDemucs),
            (true, Self::HDemucs(base)) => HDemucsConfig::infer(store, base).map(Self::HDemucs),
            (true, Self::HTDemucs(_)) => HDemucsConfig::infer(store, &HDemucsConfig::default()).map(Self::HDemucs),
        }
    }

    /// Build the network over `store`
    pub fn build(self, store: &WeightStore, name: impl Into<String>) -> MlResult<Arc<dyn SeparationModel>> {
        Ok(match self {
            Self::HTDemucs(config) => Arc::new(HTDemucs::load(store, config, name)?),
            Self::HDemucs(config) => Arc::new(HDemucs::load(store, config, name)?),
        })
    }
}

/// Summary of a model file, for inspection tools
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub kind: ModelKind,
    pub sources: Vec<StemType>,
    pub samplerate: u32,
    pub audio_channels: usize,
    pub segment_length: usize,
    pub parameter_count: usize,
    /// Native architecture, when known
    pub config: Option<NativeConfig>,
    /// Tensors in the file that the architecture does not use
    pub unused_tensors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Native,
    Onnx,
    Bag,
}

/// Loads separation models from disk
pub struct ModelLoader;

impl ModelLoader {
    /// Load any supported model file
    pub fn load(path: impl AsRef<Path>) -> MlResult<Arc<dyn SeparationModel>> {
        let path = path.as_ref();
        match Self::kind(path)? {
            ModelKind::Native => Self::load_native(path),
            ModelKind::Onnx => Ok(Arc::new(Self::load_onnx(path)?)),
            ModelKind::Bag => Ok(Arc::new(Self::load_bag(path)?)),
        }
    }

    fn kind(path: &Path) -> MlResult<ModelKind> {
        if !path.exists() {
            return Err(MlError::ModelNotFound {
                path: path.display().to_string(),
            });
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "safetensors" => Ok(ModelKind::Native),
            "onnx" => Ok(ModelKind::Onnx),
            "json" => Ok(ModelKind::Bag),
            _ => Err(MlError::ModelLoadFailed {
                reason: format!("unsupported model format '{ext}' ({})", path.display()),
            }),
        }
    }

    /// Native HTDemucs or HDemucs from safetensors
    pub fn load_native(path: impl AsRef<Path>) -> MlResult<Arc<dyn SeparationModel>> {
        let path = path.as_ref();
        let store = WeightStore::open(path)?;
        let config = Self::resolve_config(path, &store)?;
        config.build(&store, model_name(path))
    }

    /// Architecture for a weight file: sidecar if present, otherwise
    /// inferred from tensor shapes on top of the registry defaults
    pub fn resolve_config(path: &Path, store: &WeightStore) -> MlResult<NativeConfig> {
        if let Some(config) = Self::sidecar_config(path)? {
            log::debug!("Using {} config sidecar for {}", config.architecture(), path.display());
            return Ok(config);
        }
        let base = registry::find(&model_name(path))
            .map(|known| known.config())
            .unwrap_or_default();
        NativeConfig::infer(store, &base)
    }

    /// `<stem>.json` next to the model, if any
    pub fn sidecar_config(path: &Path) -> MlResult<Option<NativeConfig>> {
        let sidecar = path.with_extension("json");
        if sidecar == path || !sidecar.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&sidecar)?;
        NativeConfig::from_json(&text).map(Some)
    }

    /// ONNX export; the sidecar or the registry supplies sources and segment
    pub fn load_onnx(path: impl AsRef<Path>) -> MlResult<OnnxDemucs> {
        let path = path.as_ref();
        let config = match Self::sidecar_config(path)? {
            Some(config) => config,
            None => registry::find(&model_name(path))
                .map(|known| known.config())
                .unwrap_or_default(),
        };
        OnnxDemucs::load(path, &config)
    }

    /// Bag of models from a JSON manifest
    pub fn load_bag(path: impl AsRef<Path>) -> MlResult<BagOfModels> {
        let path = path.as_ref();
        let manifest: BagManifest = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if manifest.models.is_empty() {
            return Err(MlError::ModelLoadFailed {
                reason: format!("bag manifest {} lists no models", path.display()),
            });
        }
        if let Some(prefixes) = &manifest.prefixes {
            if prefixes.len() != manifest.models.len() {
                return Err(MlError::ModelLoadFailed {
                    reason: "bag manifest prefixes must match the model list".into(),
                });
            }
        }

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut models: Vec<Arc<dyn SeparationModel>> = Vec::with_capacity(manifest.models.len());
        for (i, member) in manifest.models.iter().enumerate() {
            let member_path = dir.join(member);
            let prefix = manifest.prefixes.as_ref().map(|p| p[i].as_str());
            let model: Arc<dyn SeparationModel> = match Self::kind(&member_path)? {
                ModelKind::Native => Self::load_member(&member_path, prefix, manifest.segment)?,
                ModelKind::Onnx => Arc::new(Self::load_onnx(&member_path)?),
                ModelKind::Bag => {
                    return Err(MlError::ModelLoadFailed {
                        reason: format!("nested bag {} is not supported", member_path.display()),
                    });
                }
            };
            models.push(model);
        }

        let weights = manifest.weights.clone().or_else(|| {
            registry::find(&model_name(path))
                .filter(|known| known.members == models.len())
                .and_then(|known| known.bag_weights())
        });

        log::info!("Loaded bag '{}' with {} models", model_name(path), models.len());
        BagOfModels::new(model_name(path), models, weights)
    }

    fn load_member(path: &Path, prefix: Option<&str>, segment: Option<f32>) -> MlResult<Arc<dyn SeparationModel>> {
        let mut store = WeightStore::open(path)?;
        if let Some(prefix) = prefix {
            store = store.strip_prefix(prefix);
        }
        let mut config = Self::resolve_config(path, &store)?;
        if let Some(segment) = segment {
            if segment > config.segment() {
                return Err(MlError::InvalidConfig(format!(
                    "bag segment {segment}s exceeds the training segment {}s",
                    config.segment()
                )));
            }
            config.set_segment(segment);
        }
        let name = match prefix {
            Some(prefix) => format!("{}[{}]", model_name(path), prefix.trim_end_matches('.')),
            None => model_name(path),
        };
        config.build(&store, name)
    }

    /// Describe a model file without running it
    pub fn inspect(path: impl AsRef<Path>) -> MlResult<ModelInfo> {
        let path = path.as_ref();
        match Self::kind(path)? {
            ModelKind::Native => {
                let store = WeightStore::open(path)?;
                let config = Self::resolve_config(path, &store)?;
                let specs = config.parameter_specs();
                store.validate(&specs)?;
                Ok(ModelInfo {
                    name: model_name(path),
                    kind: ModelKind::Native,
                    sources: config.sources().to_vec(),
                    samplerate: config.samplerate(),
                    audio_channels: config.audio_channels(),
                    segment_length: config.training_length(),
                    parameter_count: specs.iter().map(ParamSpec::numel).sum(),
                    unused_tensors: store.unused(&specs),
                    config: Some(config),
                })
            }
            kind => {
                let model = Self::load(path)?;
                Ok(ModelInfo {
                    name: model.name().to_string(),
                    kind,
                    sources: model.sources().to_vec(),
                    samplerate: model.samplerate(),
                    audio_channels: model.audio_channels(),
                    segment_length: model.segment_length(),
                    parameter_count: model.parameter_count(),
                    config: None,
                    unused_tensors: Vec::new(),
                })
            }
        }
    }
}

fn model_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
