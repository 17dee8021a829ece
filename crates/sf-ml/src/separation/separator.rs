//! High-level separator: interleaved audio in, stem collection out

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array2, Array3, ArrayView2, Axis};

use super::apply::{apply_model_with_report, ApplyOptions, ProgressCallback};
use super::config::SeparationConfig;
use super::{SeparationModel, SourceSeparator, StemCollection, StemOutput, StemType};
use crate::error::{MlError, MlResult};

/// Below this reference deviation the input is treated as silence
const SILENCE_STD: f32 = 1e-8;

/// Separates whole tracks with a shared model
pub struct Separator {
    model: Arc<dyn SeparationModel>,
    config: SeparationConfig,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Separator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Separator")
            .field("model", &self.model.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Separator {
    pub fn new(model: Arc<dyn SeparationModel>, config: SeparationConfig) -> MlResult<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        })
    }

    /// Receive overall progress in `[0, 1]` after every model evaluation
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Share an external cancellation flag
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model(&self) -> &Arc<dyn SeparationModel> {
        &self.model
    }

    pub fn config(&self) -> &SeparationConfig {
        &self.config
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation; the running separation stops before its next segment
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn options(&self) -> ApplyOptions {
        let mut options = ApplyOptions::from(&self.config).with_cancel(Arc::clone(&self.cancel));
        options.progress = self.progress.clone();
        options
    }

    /// Planar `[C, L]` at the model rate to `[S, C_model, L]`, with
    /// reference normalization around the model
    pub fn separate_planar(&self, mix: ArrayView2<f32>) -> MlResult<(Array3<f32>, usize)> {
        let mix = convert_channels(mix, self.model.audio_channels())?;

        let reference = mix.mean_axis(Axis(0)).ok_or_else(|| MlError::InvalidInputShape {
            expected: "at least one channel".into(),
            got: "0".into(),
        })?;
        let mean = reference.mean().unwrap_or(0.0);
        let std = if reference.len() > 1 { reference.std(1.0) } else { 0.0 };
        let scale = std > SILENCE_STD;

        let normalized = if scale {
            mix.mapv(|v| (v - mean) / std)
        } else {
            log::debug!("Reference deviation {std:e}, skipping normalization");
            mix
        };

        let (mut sources, report) = apply_model_with_report(self.model.as_ref(), normalized.view(), &self.options())?;

        if scale {
            sources.mapv_inplace(|v| v * std + mean);
        }
        Ok((sources, report.evaluations))
    }
}

impl SourceSeparator for Separator {
    fn separate(&self, audio: &[f32], channels: usize, sample_rate: u32) -> MlResult<StemCollection> {
        if audio.is_empty() || channels == 0 {
            return Err(MlError::InvalidInputShape {
                expected: "non-empty audio".into(),
                got: "empty".into(),
            });
        }
        if audio.len() % channels != 0 {
            return Err(MlError::InvalidInputShape {
                expected: format!("a multiple of {channels} samples"),
                got: audio.len().to_string(),
            });
        }
        let model_rate = self.model.samplerate();
        if sample_rate != model_rate {
            return Err(MlError::InvalidSampleRate {
                expected: model_rate,
                got: sample_rate,
            });
        }

        let start = Instant::now();
        let frames = audio.len() / channels;
        let planar = Array2::from_shape_fn((channels, frames), |(c, i)| audio[i * channels + c]);

        let (stems, evaluations) = self.separate_planar(planar.view())?;
        let stem_channels = stems.len_of(Axis(1));

        let mut collection = StemCollection::new(model_rate, self.model.name().to_string());
        for (idx, stem_type) in self.model.sources().iter().enumerate() {
            let source = stems.index_axis(Axis(0), idx);
            // interleave
            let audio: Vec<f32> = source.t().iter().copied().collect();
            collection.add(StemOutput::new(*stem_type, audio, stem_channels, model_rate));
        }
        collection.update_energy_shares();

        let elapsed = start.elapsed();
        let duration = frames as f64 / model_rate as f64;
        collection.stats.total_time_ms = elapsed.as_millis() as u64;
        collection.stats.segments_processed = evaluations;
        collection.stats.shifts = self.config.shifts;
        collection.stats.rtf = (duration / elapsed.as_secs_f64().max(1e-9)) as f32;

        log::info!(
            "Separated {:.1}s into {} stems in {:.1}s ({} evaluations)",
            duration,
            collection.len(),
            elapsed.as_secs_f64(),
            evaluations
        );
        Ok(collection)
    }

    fn available_stems(&self) -> &[StemType] {
        self.model.sources()
    }

    fn model_name(&self) -> &str {
        self.model.name()
    }

    fn estimated_memory_mb(&self, duration_secs: f32) -> f32 {
        self.config
            .estimated_memory_mb(duration_secs, self.model.samplerate(), self.model.sources().len())
    }
}

/// Adapt `[C, L]` to `target` channels: mono is duplicated, a mono target
/// averages, extra channels are dropped
pub fn convert_channels(mix: ArrayView2<f32>, target: usize) -> MlResult<Array2<f32>> {
    let channels = mix.nrows();
    if channels == 0 || target == 0 {
        return Err(MlError::ChannelMismatch {
            expected: target,
            got: channels,
        });
    }
    if channels == target {
        return Ok(mix.to_owned());
    }
    if target == 1 {
        return mix
            .mean_axis(Axis(0))
            .map(|m| m.insert_axis(Axis(0)))
            .ok_or_else(|| MlError::ChannelMismatch { expected: 1, got: channels });
    }
    if channels == 1 {
        let row = mix.row(0);
        return Ok(Array2::from_shape_fn((target, mix.ncols()), |(_, i)| row[i]));
    }
    if channels > target {
        return Ok(mix.slice(ndarray::s![..target, ..]).to_owned());
    }
    Err(MlError::ChannelMismatch {
        expected: target,
        got: channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Puts `gain * mix` in every source
    struct Scaled {
        sources: Vec<StemType>,
        gain: f32,
    }

    impl SeparationModel for Scaled {
        fn name(&self) -> &str {
            "scaled"
        }

        fn sources(&self) -> &[StemType] {
            &self.sources
        }

        fn samplerate(&self) -> u32 {
            8000
        }

        fn audio_channels(&self) -> usize {
            2
        }

        fn segment_length(&self) -> usize {
            800
        }

        fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
            let s = self.sources.len();
            Ok(Array3::from_shape_fn((s, mix.nrows(), mix.ncols()), |(_, c, t)| mix[[c, t]] * self.gain))
        }
    }

    fn separator(gain: f32) -> Separator {
        let model = Arc::new(Scaled {
            sources: StemType::vocals_2(),
            gain,
        });
        Separator::new(model, SeparationConfig::default().with_shifts(0)).unwrap()
    }

    fn stereo(frames: usize) -> Vec<f32> {
        (0..frames * 2)
            .map(|i| 0.3 + 0.5 * ((i / 2) as f32 * 0.01 + (i % 2) as f32).sin())
            .collect()
    }

    #[test]
    fn test_reference_normalization_is_undone() {
        let audio = stereo(3000);
        let stems = separator(1.0).separate(&audio, 2, 8000).unwrap();
        assert_eq!(stems.len(), 2);
        for stem in stems.iter() {
            assert_eq!(stem.audio.len(), audio.len());
            for (a, b) in stem.audio.iter().zip(&audio) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
        assert!(stems.stats.segments_processed > 0);
    }

    #[test]
    fn test_default_config_with_shift() {
        let model = Arc::new(Scaled {
            sources: StemType::standard_4(),
            gain: 1.0,
        });
        let sep = Separator::new(model, SeparationConfig::default()).unwrap();
        // 2.3 segments, so the shifted pass ends mid-segment
        let audio = stereo(1850);
        let stems = sep.separate(&audio, 2, 8000).unwrap();
        assert_eq!(stems.len(), 4);
        for stem in stems.iter() {
            assert_eq!(stem.audio.len(), audio.len());
            for (a, b) in stem.audio.iter().zip(&audio) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_offset_is_restored_per_stem() {
        // a zero model returns the reference mean in every stem
        let audio = stereo(1000);
        let stems = separator(0.0).separate(&audio, 2, 8000).unwrap();
        let planar = Array2::from_shape_fn((2, 1000), |(c, i)| audio[i * 2 + c]);
        let mean = planar.mean().unwrap();
        for v in &stems.get(StemType::Vocals).unwrap().audio {
            assert_abs_diff_eq!(*v, mean, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_silence_passes_through() {
        let stems = separator(1.0).separate(&[0.0; 1600], 2, 8000).unwrap();
        assert!(stems.iter().all(|s| s.audio.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn test_mono_is_duplicated() {
        let mono: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.02).sin()).collect();
        let stems = separator(1.0).separate(&mono, 1, 8000).unwrap();
        let vocals = stems.get(StemType::Vocals).unwrap();
        assert_eq!(vocals.channels, 2);
        for (a, b) in vocals.channel(0).iter().zip(&mono) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        assert_eq!(vocals.channel(0), vocals.channel(1));
    }

    #[test]
    fn test_rejects_bad_input() {
        let sep = separator(1.0);
        assert!(matches!(
            sep.separate(&stereo(100), 2, 44100),
            Err(MlError::InvalidSampleRate { .. })
        ));
        assert!(sep.separate(&[], 2, 8000).is_err());
        assert!(sep.separate(&[0.0; 5], 2, 8000).is_err());
    }

    #[test]
    fn test_cancel_flag() {
        let sep = separator(1.0);
        sep.cancel();
        assert!(matches!(sep.separate(&stereo(100), 2, 8000), Err(MlError::Cancelled)));
    }

    #[test]
    fn test_convert_channels() {
        let surround = Array2::from_shape_fn((6, 4), |(c, i)| (c * 10 + i) as f32);
        let stereo = convert_channels(surround.view(), 2).unwrap();
        assert_eq!(stereo.dim(), (2, 4));
        assert_eq!(stereo[[1, 3]], 13.0);

        let mono = convert_channels(stereo.view(), 1).unwrap();
        assert_eq!(mono[[0, 0]], 5.0);
    }
}
