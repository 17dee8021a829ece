//! ONNX inference engine on tract (pure Rust, CPU)
//!
//! Exported Demucs graphs usually carry a symbolic time axis; pinning the
//! input fact to the model segment lets tract optimise the whole graph.

use std::path::Path;

use ndarray::{Array3, Array4, ArrayD, Ix4};

use crate::error::{MlError, MlResult};

/// Configuration for inference engine
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Fixed `[batch, channels, samples]` input shape, `None` keeps the graph's own facts
    pub input_shape: Option<[usize; 3]>,
    /// Run tract's graph optimiser after loading
    pub optimize_graph: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            input_shape: None,
            optimize_graph: true,
        }
    }
}

impl InferenceConfig {
    pub fn with_input_shape(mut self, shape: [usize; 3]) -> Self {
        self.input_shape = Some(shape);
        self
    }
}

/// Tract model wrapper
struct TractModel {
    model: tract_onnx::prelude::SimplePlan<
        tract_onnx::prelude::TypedFact,
        Box<dyn tract_onnx::prelude::TypedOp>,
        tract_onnx::prelude::Graph<tract_onnx::prelude::TypedFact, Box<dyn tract_onnx::prelude::TypedOp>>,
    >,
}

/// Loaded ONNX graph ready to run
pub struct InferenceEngine {
    tract_model: TractModel,
    config: InferenceConfig,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine").field("config", &self.config).finish()
    }
}

impl InferenceEngine {
    /// Create new inference engine with model
    pub fn new<P: AsRef<Path>>(model_path: P, config: InferenceConfig) -> MlResult<Self> {
        let path = model_path.as_ref();

        if !path.exists() {
            return Err(MlError::ModelNotFound {
                path: path.display().to_string(),
            });
        }

        log::info!("Loading ONNX model {}", path.display());
        let model = Self::load_tract_model(path, &config)?;

        Ok(Self {
            tract_model: model,
            config,
        })
    }

    /// Load tract model
    fn load_tract_model(path: &Path, config: &InferenceConfig) -> MlResult<TractModel> {
        use tract_onnx::prelude::*;

        let mut model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| MlError::TractError(e.to_string()))?;

        if let Some(shape) = config.input_shape {
            model = model
                .with_input_fact(0, f32::fact(shape).into())
                .map_err(|e| MlError::TractError(e.to_string()))?;
        }

        let typed = match config.optimize_graph {
            true => model.into_optimized(),
            false => model.into_typed(),
        };
        let typed = typed.map_err(|e| MlError::TractError(e.to_string()))?;

        let model = typed
            .into_runnable()
            .map_err(|e| MlError::TractError(e.to_string()))?;

        Ok(TractModel { model })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Run inference with f32 input/output
    pub fn run_f32(&self, inputs: &[ArrayD<f32>]) -> MlResult<Vec<ArrayD<f32>>> {
        use tract_onnx::prelude::*;

        let tract_inputs: TVec<TValue> = inputs
            .iter()
            .map(|arr| {
                let tensor: Tensor = arr.clone().into();
                tensor.into()
            })
            .collect();

        let outputs = self
            .tract_model
            .model
            .run(tract_inputs)
            .map_err(|e| MlError::TractError(e.to_string()))?;

        let mut result = Vec::with_capacity(outputs.len());
        for output in outputs.iter() {
            let tensor = output
                .to_array_view::<f32>()
                .map_err(|e| MlError::TractError(e.to_string()))?;
            result.push(tensor.to_owned().into_dyn());
        }

        Ok(result)
    }

    /// Input: `[batch, channels, samples]`
    /// Output: `[batch, stems, channels, samples]`
    pub fn run_array3(&self, input: &Array3<f32>) -> MlResult<Array4<f32>> {
        let outputs = self.run_f32(&[input.clone().into_dyn()])?;

        let output = outputs.into_iter().next().ok_or_else(|| MlError::InferenceFailed {
            reason: "No output from model".into(),
        })?;

        if output.ndim() != 4 {
            return Err(MlError::InvalidOutputShape {
                expected: "4D tensor [batch, stems, channels, samples]".into(),
                got: format!("{}D tensor {:?}", output.ndim(), output.shape()),
            });
        }

        output
            .into_dimensionality::<Ix4>()
            .map_err(|e| MlError::ProcessingFailed(format!("Shape conversion failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model() {
        let result = InferenceEngine::new("/nonexistent/model.onnx", InferenceConfig::default());
        assert!(matches!(result, Err(MlError::ModelNotFound { .. })));
    }

    #[test]
    fn test_config_builder() {
        let config = InferenceConfig::default().with_input_shape([1, 2, 343_980]);
        assert_eq!(config.input_shape, Some([1, 2, 343_980]));
        assert!(config.optimize_graph);
    }
}
