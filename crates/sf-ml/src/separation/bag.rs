//! Ensembles of separation models averaged per source

use std::sync::Arc;

use ndarray::{Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{SeparationModel, StemType};
use crate::error::{MlError, MlResult};

/// Bag manifest stored as JSON next to the member weight files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BagManifest {
    /// Member model files, relative to the manifest
    pub models: Vec<String>,
    /// Key prefix per member when several members share one file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefixes: Option<Vec<String>>,
    /// `weights[model][source]`, all ones when absent
    #[serde(default)]
    pub weights: Option<Vec<Vec<f32>>>,
    /// Segment override in seconds for every member
    #[serde(default)]
    pub segment: Option<f32>,
}

/// Several models sharing sources, sample rate and channels.
///
/// Each source of the bag output is the weighted average of that source
/// across members.
pub struct BagOfModels {
    name: String,
    models: Vec<Arc<dyn SeparationModel>>,
    weights: Vec<Vec<f32>>,
    totals: Vec<f32>,
}

impl std::fmt::Debug for BagOfModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BagOfModels")
            .field("name", &self.name)
            .field("models", &self.models.iter().map(|m| m.name().to_string()).collect::<Vec<_>>())
            .field("weights", &self.weights)
            .finish()
    }
}

impl BagOfModels {
    pub fn new(
        name: impl Into<String>,
        models: Vec<Arc<dyn SeparationModel>>,
        weights: Option<Vec<Vec<f32>>>,
    ) -> MlResult<Self> {
        let first = models
            .first()
            .ok_or_else(|| MlError::InvalidConfig("a bag needs at least one model".into()))?;

        for other in &models[1..] {
            if other.sources() != first.sources()
                || other.samplerate() != first.samplerate()
                || other.audio_channels() != first.audio_channels()
            {
                return Err(MlError::InvalidConfig(format!(
                    "bag member '{}' is incompatible with '{}'",
                    other.name(),
                    first.name()
                )));
            }
        }

        let num_sources = first.sources().len();
        let weights = weights.unwrap_or_else(|| vec![vec![1.0; num_sources]; models.len()]);
        if weights.len() != models.len() || weights.iter().any(|w| w.len() != num_sources) {
            return Err(MlError::InvalidConfig(format!(
                "bag weights must be {} x {num_sources}",
                models.len()
            )));
        }

        let totals: Vec<f32> = (0..num_sources)
            .map(|k| weights.iter().map(|w| w[k]).sum())
            .collect();
        if let Some(k) = totals.iter().position(|t| t.abs() < f32::EPSILON) {
            return Err(MlError::InvalidConfig(format!(
                "source {} has zero total weight in the bag",
                first.sources()[k]
            )));
        }

        Ok(Self {
            name: name.into(),
            models,
            weights,
            totals,
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Members with their per-source weights
    pub fn members(&self) -> impl Iterator<Item = (&Arc<dyn SeparationModel>, &Vec<f32>)> {
        self.models.iter().zip(&self.weights)
    }

    /// Per-source sum of member weights
    pub fn totals(&self) -> &[f32] {
        &self.totals
    }
}

impl SeparationModel for BagOfModels {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[StemType] {
        self.models[0].sources()
    }

    fn samplerate(&self) -> u32 {
        self.models[0].samplerate()
    }

    fn audio_channels(&self) -> usize {
        self.models[0].audio_channels()
    }

    /// Shortest member segment
    fn segment_length(&self) -> usize {
        self.models.iter().map(|m| m.segment_length()).min().unwrap_or(0)
    }

    fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
        let mut estimates: Option<Array3<f32>> = None;
        for (model, weights) in self.members() {
            let mut out = model.forward(mix)?;
            for (k, w) in weights.iter().enumerate() {
                out.index_axis_mut(Axis(0), k).mapv_inplace(|v| v * w);
            }
            match estimates.as_mut() {
                Some(acc) => *acc += &out,
                None => estimates = Some(out),
            }
        }
        let mut estimates = estimates.ok_or_else(|| MlError::InvalidConfig("empty bag of models".into()))?;
        for (k, total) in self.totals.iter().enumerate() {
            estimates.index_axis_mut(Axis(0), k).mapv_inplace(|v| v / total);
        }
        Ok(estimates)
    }

    fn parameter_count(&self) -> usize {
        self.models.iter().map(|m| m.parameter_count()).sum()
    }

    fn as_bag(&self) -> Option<&BagOfModels> {
        Some(self)
    }
}
