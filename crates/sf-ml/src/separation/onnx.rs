//! Demucs exported to ONNX, run through tract
//!
//! The graph takes `[1, C, segment]` and returns `[1, S, C, segment]`; the
//! architecture description (sources, rate, segment) comes from the same
//! JSON sidecar the native loader reads.

use std::path::Path;

use ndarray::{Array3, ArrayView2, Axis};

use super::{SeparationModel, StemType};
use crate::error::{MlError, MlResult};
use crate::loader::NativeConfig;
use crate::inference::{InferenceConfig, InferenceEngine};

#[derive(Debug)]
pub struct OnnxDemucs {
    name: String,
    engine: InferenceEngine,
    sources: Vec<StemType>,
    samplerate: u32,
    audio_channels: usize,
    segment_length: usize,
}

impl OnnxDemucs {
    pub fn load(path: impl AsRef<Path>, config: &NativeConfig) -> MlResult<Self> {
        let path = path.as_ref();
        let segment_length = config.training_length();
        if segment_length == 0 || config.sources().is_empty() {
            return Err(MlError::InvalidConfig(
                "ONNX model needs a non-empty segment and source list".into(),
            ));
        }

        let engine = InferenceEngine::new(
            path,
            InferenceConfig::default().with_input_shape([1, config.audio_channels(), segment_length]),
        )?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".into());

        Ok(Self {
            name,
            engine,
            sources: config.sources().to_vec(),
            samplerate: config.samplerate(),
            audio_channels: config.audio_channels(),
            segment_length,
        })
    }
}

impl SeparationModel for OnnxDemucs {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[StemType] {
        &self.sources
    }

    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn audio_channels(&self) -> usize {
        self.audio_channels
    }

    fn segment_length(&self) -> usize {
        self.segment_length
    }

    fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
        let (channels, length) = mix.dim();
        if channels != self.audio_channels || length != self.segment_length {
            return Err(MlError::InvalidInputShape {
                expected: format!("[{}, {}]", self.audio_channels, self.segment_length),
                got: format!("[{channels}, {length}]"),
            });
        }

        let input = mix.to_owned().insert_axis(Axis(0));
        let output = self.engine.run_array3(&input)?;

        let expected = (1, self.sources.len(), channels, length);
        if output.dim() != expected {
            return Err(MlError::InvalidOutputShape {
                expected: format!("{expected:?}"),
                got: format!("{:?}", output.dim()),
            });
        }
        Ok(output.index_axis_move(Axis(0), 0))
    }
}
