//! Segment scheduler: shift averaging, overlap-add splitting and ensembles
//!
//! ```text
//!   apply(bag)    ──► apply(member) per model, weighted per source
//!   apply(shifts) ──► pad by max_shift, N random offsets, realign, average
//!   apply(split)  ──► segments with stride (1-overlap)*segment, triangular overlap-add
//!   leaf          ──► centre the chunk in valid_length with real context, forward, centre-trim
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::config::SeparationConfig;
use super::SeparationModel;
use crate::error::{MlError, MlResult};

/// Overall progress in `[0, 1]`
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Fixed-point resolution of the progress accumulator
const PROGRESS_UNIT: f64 = 1_000_000.0;

/// Maximum shift of the shift trick, in seconds
const MAX_SHIFT_SECS: f64 = 0.5;

/// Scheduler options
#[derive(Clone)]
pub struct ApplyOptions {
    pub shifts: usize,
    pub split: bool,
    pub overlap: f32,
    pub transition_power: f32,
    /// Segment in seconds, `None` uses the model's own
    pub segment: Option<f32>,
    /// Segments evaluated concurrently, 0 runs inline
    pub num_workers: usize,
    pub seed: u64,
    pub cancel: Option<Arc<AtomicBool>>,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("shifts", &self.shifts)
            .field("split", &self.split)
            .field("overlap", &self.overlap)
            .field("transition_power", &self.transition_power)
            .field("segment", &self.segment)
            .field("num_workers", &self.num_workers)
            .field("seed", &self.seed)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from(&SeparationConfig::default())
    }
}

impl From<&SeparationConfig> for ApplyOptions {
    fn from(config: &SeparationConfig) -> Self {
        Self {
            shifts: config.shifts,
            split: config.split,
            overlap: config.overlap,
            transition_power: config.transition_power,
            segment: config.segment,
            num_workers: config.num_workers,
            seed: config.seed,
            cancel: None,
            progress: None,
        }
    }
}

impl ApplyOptions {
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// What a scheduler run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Model forward passes
    pub evaluations: usize,
}

/// A window into a planar `[C, L]` signal; offsets of nested chunks compose
#[derive(Debug, Clone, Copy)]
pub struct TensorChunk<'a> {
    tensor: ArrayView2<'a, f32>,
    offset: usize,
    length: usize,
}

impl<'a> TensorChunk<'a> {
    pub fn new(tensor: ArrayView2<'a, f32>) -> Self {
        let length = tensor.ncols();
        Self {
            tensor,
            offset: 0,
            length,
        }
    }

    /// Sub-chunk starting `offset` samples into this one, clipped to the
    /// end of this chunk (the signal beyond it is only used as context)
    pub fn sub(&self, offset: usize, length: usize) -> Self {
        let offset = offset.min(self.length);
        Self {
            tensor: self.tensor,
            offset: self.offset + offset,
            length: length.min(self.length - offset),
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn channels(&self) -> usize {
        self.tensor.nrows()
    }

    pub fn view(&self) -> ArrayView2<'a, f32> {
        self.tensor.slice_move(s![.., self.offset..self.offset + self.length])
    }

    /// Centre the chunk in `target` samples, filling with the surrounding
    /// signal where it exists and zeros beyond it
    pub fn padded(&self, target: usize) -> MlResult<Array2<f32>> {
        if target < self.length {
            return Err(MlError::InvalidInputShape {
                expected: format!("at least {} samples", self.length),
                got: target.to_string(),
            });
        }
        let total = self.tensor.ncols() as isize;
        let delta = (target - self.length) as isize;
        let start = self.offset as isize - delta / 2;
        let end = start + target as isize;
        let correct_start = start.max(0);
        let correct_end = end.min(total);

        let mut out = Array2::<f32>::zeros((self.channels(), target));
        if correct_end > correct_start {
            let dst = (correct_start - start) as usize;
            let len = (correct_end - correct_start) as usize;
            out.slice_mut(s![.., dst..dst + len]).assign(
                &self
                    .tensor
                    .slice(s![.., correct_start as usize..correct_end as usize]),
            );
        }
        Ok(out)
    }
}

/// Separate `mix` `[C, L]` into `[S, C, L]`
pub fn apply_model(model: &dyn SeparationModel, mix: ArrayView2<f32>, options: &ApplyOptions) -> MlResult<Array3<f32>> {
    apply_model_with_report(model, mix, options).map(|(out, _)| out)
}

/// [`apply_model`], also returning run statistics
pub fn apply_model_with_report(
    model: &dyn SeparationModel,
    mix: ArrayView2<f32>,
    options: &ApplyOptions,
) -> MlResult<(Array3<f32>, ApplyReport)> {
    if mix.nrows() != model.audio_channels() {
        return Err(MlError::ChannelMismatch {
            expected: model.audio_channels(),
            got: mix.nrows(),
        });
    }
    if mix.ncols() == 0 {
        return Err(MlError::InvalidInputShape {
            expected: "non-empty mix".into(),
            got: "0 samples".into(),
        });
    }
    if !(0.0..1.0).contains(&options.overlap) || options.transition_power < 1.0 {
        return Err(MlError::InvalidConfig(format!(
            "overlap {} / transition_power {} out of range",
            options.overlap, options.transition_power
        )));
    }

    let pool = if options.num_workers > 0 {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(options.num_workers)
                .thread_name(|i| format!("sf-separate-{i}"))
                .build()
                .map_err(|e| MlError::ProcessingFailed(format!("worker pool: {e}")))?,
        )
    } else {
        None
    };

    let run = Scheduler {
        options,
        pool,
        rng: Mutex::new(ChaCha8Rng::seed_from_u64(options.seed)),
        done: AtomicU64::new(0),
        evaluations: AtomicUsize::new(0),
    };

    log::debug!(
        "Separating {} samples with '{}' ({:?})",
        mix.ncols(),
        model.name(),
        options
    );

    let out = run.apply(model, TensorChunk::new(mix), options.shifts, options.split, 1.0)?;
    if let Some(progress) = &options.progress {
        progress(1.0);
    }
    let report = ApplyReport {
        evaluations: run.evaluations.load(Ordering::Relaxed),
    };
    Ok((out, report))
}

/// Triangular overlap-add window of `length` samples
pub fn transition_weight(length: usize, power: f32) -> Array1<f32> {
    let half = length / 2;
    let peak = half.max(length - half).max(1) as f32;
    Array1::from_shape_fn(length, |i| {
        let ramp = if i < half { i + 1 } else { length - i };
        (ramp as f32 / peak).powf(power)
    })
}

struct Scheduler<'o> {
    options: &'o ApplyOptions,
    pool: Option<rayon::ThreadPool>,
    /// Shift offsets, one stream per run shared by every bag member
    rng: Mutex<ChaCha8Rng>,
    /// Completed work, in [`PROGRESS_UNIT`]s
    done: AtomicU64,
    evaluations: AtomicUsize,
}

impl Scheduler<'_> {
    /// `share` is the fraction of the whole job this call represents
    fn apply(
        &self,
        model: &dyn SeparationModel,
        chunk: TensorChunk<'_>,
        shifts: usize,
        split: bool,
        share: f64,
    ) -> MlResult<Array3<f32>> {
        if let Some(bag) = model.as_bag() {
            let member_share = share / bag.len() as f64;
            let mut estimates: Option<Array3<f32>> = None;
            for (member, weights) in bag.members() {
                let mut out = self.apply(member.as_ref(), chunk, shifts, split, member_share)?;
                for (k, w) in weights.iter().enumerate() {
                    out.index_axis_mut(Axis(0), k).mapv_inplace(|v| v * w);
                }
                match estimates.as_mut() {
                    Some(acc) => *acc += &out,
                    None => estimates = Some(out),
                }
            }
            let mut estimates = estimates.ok_or_else(|| MlError::InvalidConfig("empty bag of models".into()))?;
            for (k, total) in bag.totals().iter().enumerate() {
                estimates.index_axis_mut(Axis(0), k).mapv_inplace(|v| v / total);
            }
            return Ok(estimates);
        }

        if shifts > 0 {
            return self.apply_shifted(model, chunk, shifts, split, share);
        }
        if split {
            return self.apply_split(model, chunk, share);
        }
        self.evaluate(model, chunk, share)
    }

    fn apply_shifted(
        &self,
        model: &dyn SeparationModel,
        chunk: TensorChunk<'_>,
        shifts: usize,
        split: bool,
        share: f64,
    ) -> MlResult<Array3<f32>> {
        let length = chunk.len();
        let max_shift = (MAX_SHIFT_SECS * model.samplerate() as f64) as usize;
        let padded = chunk.padded(length + 2 * max_shift)?;
        let padded_chunk = TensorChunk::new(padded.view());
        let offsets: Vec<usize> = {
            let mut rng = self.rng.lock();
            (0..shifts).map(|_| rng.random_range(0..=max_shift)).collect()
        };

        let mut out = Array3::<f32>::zeros((model.sources().len(), chunk.channels(), length));
        for offset in offsets {
            let shifted = padded_chunk.sub(offset, length + max_shift - offset);
            let res = self.apply(model, shifted, 0, split, share / shifts as f64)?;
            let start = max_shift - offset;
            out += &res.slice(s![.., .., start..start + length]);
        }
        out /= shifts as f32;
        Ok(out)
    }

    fn apply_split(&self, model: &dyn SeparationModel, chunk: TensorChunk<'_>, share: f64) -> MlResult<Array3<f32>> {
        let length = chunk.len();
        let segment_length = match self.options.segment {
            Some(seconds) => (model.samplerate() as f64 * seconds as f64) as usize,
            None => model.segment_length(),
        };
        if segment_length == 0 || segment_length > model.segment_length() {
            return Err(MlError::InvalidConfig(format!(
                "segment of {segment_length} samples not supported by '{}' (max {})",
                model.name(),
                model.segment_length()
            )));
        }

        let stride = (((1.0 - self.options.overlap) as f64 * segment_length as f64) as usize).max(1);
        let offsets: Vec<usize> = (0..length).step_by(stride).collect();
        let weight = transition_weight(segment_length, self.options.transition_power);
        let segment_share = share / offsets.len() as f64;

        let sources = model.sources().len();
        let mut out = Array3::<f32>::zeros((sources, chunk.channels(), length));
        let mut sum_weight = Array1::<f32>::zeros(length);

        let batch = self.options.num_workers.max(1) * 2;
        for group in offsets.chunks(batch) {
            let results: Vec<MlResult<Array3<f32>>> = match &self.pool {
                Some(pool) => pool.install(|| {
                    group
                        .par_iter()
                        .map(|&offset| self.evaluate(model, chunk.sub(offset, segment_length), segment_share))
                        .collect()
                }),
                None => group
                    .iter()
                    .map(|&offset| self.evaluate(model, chunk.sub(offset, segment_length), segment_share))
                    .collect(),
            };

            for (&offset, result) in group.iter().zip(results) {
                let chunk_out = result?;
                let chunk_length = chunk_out.len_of(Axis(2));
                let w = weight.slice(s![..chunk_length]);
                let mut target = out.slice_mut(s![.., .., offset..offset + chunk_length]);
                target += &(&chunk_out * &w);
                let mut weights = sum_weight.slice_mut(s![offset..offset + chunk_length]);
                weights += &w;
            }
        }

        for mut lane in out.lanes_mut(Axis(2)) {
            lane /= &sum_weight;
        }
        Ok(out)
    }

    /// One model evaluation on a chunk no longer than the model segment
    fn evaluate(&self, model: &dyn SeparationModel, chunk: TensorChunk<'_>, share: f64) -> MlResult<Array3<f32>> {
        if let Some(cancel) = &self.options.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(MlError::Cancelled);
            }
        }

        let length = chunk.len();
        let valid_length = model.valid_length(length)?;
        let padded = chunk.padded(valid_length)?;
        let out = model.forward(padded.view())?;

        let (sources, channels, produced) = out.dim();
        if sources != model.sources().len() || channels != chunk.channels() || produced < length {
            return Err(MlError::InvalidOutputShape {
                expected: format!("[{}, {}, >= {length}]", model.sources().len(), chunk.channels()),
                got: format!("[{sources}, {channels}, {produced}]"),
            });
        }
        let trim = (produced - length) / 2;
        let out = out.slice(s![.., .., trim..trim + length]).to_owned();

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.advance(share);
        Ok(out)
    }

    fn advance(&self, share: f64) {
        let units = (share * PROGRESS_UNIT) as u64;
        let done = self.done.fetch_add(units, Ordering::Relaxed) + units;
        if let Some(progress) = &self.options.progress {
            progress((done as f64 / PROGRESS_UNIT).min(1.0) as f32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separation::{BagOfModels, StemType};
    use approx::assert_abs_diff_eq;
    use std::sync::Mutex;

    /// Splits the mix evenly across sources, so stems always sum to the mix
    struct EvenSplit {
        sources: Vec<StemType>,
        segment: usize,
        calls: AtomicUsize,
    }

    impl EvenSplit {
        fn new(segment: usize) -> Self {
            Self {
                sources: StemType::standard_4(),
                segment,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SeparationModel for EvenSplit {
        fn name(&self) -> &str {
            "even"
        }

        fn sources(&self) -> &[StemType] {
            &self.sources
        }

        fn samplerate(&self) -> u32 {
            1000
        }

        fn audio_channels(&self) -> usize {
            2
        }

        fn segment_length(&self) -> usize {
            self.segment
        }

        fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
            assert_eq!(mix.ncols(), self.segment);
            self.calls.fetch_add(1, Ordering::Relaxed);
            let s = self.sources.len();
            Ok(Array3::from_shape_fn((s, mix.nrows(), mix.ncols()), |(_, c, t)| mix[[c, t]] / s as f32))
        }
    }

    /// Copies the mix into one source only
    struct OneHot {
        sources: Vec<StemType>,
        index: usize,
    }

    impl SeparationModel for OneHot {
        fn name(&self) -> &str {
            "one-hot"
        }

        fn sources(&self) -> &[StemType] {
            &self.sources
        }

        fn samplerate(&self) -> u32 {
            1000
        }

        fn audio_channels(&self) -> usize {
            2
        }

        fn segment_length(&self) -> usize {
            300
        }

        fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
            let mut out = Array3::zeros((self.sources.len(), mix.nrows(), mix.ncols()));
            out.index_axis_mut(Axis(0), self.index).assign(&mix);
            Ok(out)
        }
    }

    /// Silent model that logs the sum of every window it is given
    struct Recorder {
        sources: Vec<StemType>,
        windows: Mutex<Vec<i64>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                sources: StemType::standard_4(),
                windows: Mutex::new(Vec::new()),
            }
        }

        fn sorted_windows(&self) -> Vec<i64> {
            let mut windows = self.windows.lock().unwrap().clone();
            windows.sort_unstable();
            windows
        }
    }

    impl SeparationModel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn sources(&self) -> &[StemType] {
            &self.sources
        }

        fn samplerate(&self) -> u32 {
            1000
        }

        fn audio_channels(&self) -> usize {
            2
        }

        fn segment_length(&self) -> usize {
            300
        }

        fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
            let sum: f64 = mix.iter().map(|&v| v as f64).sum();
            self.windows.lock().unwrap().push((sum * 1000.0).round() as i64);
            Ok(Array3::zeros((self.sources.len(), mix.nrows(), mix.ncols())))
        }
    }

    fn mix(length: usize) -> Array2<f32> {
        Array2::from_shape_fn((2, length), |(c, t)| ((t as f32 * 0.013).sin() + c as f32 * 0.3) * 0.5)
    }

    fn assert_sums_to_mix(out: &Array3<f32>, mix: &Array2<f32>) {
        let sum = out.sum_axis(Axis(0));
        for (a, b) in sum.iter().zip(mix.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_chunk_offsets_compose() {
        let signal = Array2::from_shape_fn((1, 10), |(_, t)| t as f32);
        let parent = TensorChunk::new(signal.view()).sub(2, 6);
        let chunk = parent.sub(3, 10);
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.view().row(0).to_vec(), vec![5.0, 6.0, 7.0]);

        // context past the parent is still reachable through padding
        assert_eq!(chunk.padded(5).unwrap().row(0).to_vec(), vec![4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(parent.sub(9, 4).is_empty());
    }

    #[test]
    fn test_chunk_padded_uses_context() {
        let signal = Array2::from_shape_fn((1, 10), |(_, t)| t as f32 + 1.0);
        let chunk = TensorChunk::new(signal.view()).sub(1, 3);
        let padded = chunk.padded(7).unwrap();
        assert_eq!(padded.row(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(chunk.padded(2).is_err());
    }

    #[test]
    fn test_transition_weight() {
        let w = transition_weight(6, 1.0);
        assert_eq!(w.to_vec(), vec![1.0 / 3.0, 2.0 / 3.0, 1.0, 1.0, 2.0 / 3.0, 1.0 / 3.0]);
        let w = transition_weight(5, 2.0);
        assert_abs_diff_eq!(w[0], 1.0 / 9.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w[2], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_split_sums_to_mix() {
        let model = EvenSplit::new(300);
        let input = mix(1234);
        for overlap in [0.0, 0.25, 0.5] {
            let options = ApplyOptions {
                shifts: 0,
                overlap,
                ..ApplyOptions::default()
            };
            let out = apply_model(&model, input.view(), &options).unwrap();
            assert_eq!(out.dim(), (4, 2, 1234));
            assert_sums_to_mix(&out, &input);
        }
    }

    #[test]
    fn test_shifts_and_workers_sum_to_mix() {
        let model = EvenSplit::new(300);
        let input = mix(2000);
        let options = ApplyOptions {
            shifts: 2,
            num_workers: 3,
            seed: 42,
            ..ApplyOptions::default()
        };
        let (out, report) = apply_model_with_report(&model, input.view(), &options).unwrap();
        assert_sums_to_mix(&out, &input);
        assert_eq!(report.evaluations, model.calls.load(Ordering::Relaxed));
        assert!(report.evaluations >= 2 * 9);
    }

    #[test]
    fn test_default_options_shift_last_segment() {
        // the last segment of a shifted pass ends inside the shift padding
        let model = EvenSplit::new(300);
        let input = mix(2000);
        let options = ApplyOptions::default();
        assert_eq!(options.shifts, 1);

        let out = apply_model(&model, input.view(), &options).unwrap();
        assert_eq!(out.dim(), (4, 2, 2000));
        assert_sums_to_mix(&out, &input);
    }

    #[test]
    fn test_custom_segment() {
        let model = EvenSplit::new(300);
        let input = mix(1000);
        let options = ApplyOptions {
            shifts: 0,
            segment: Some(0.1),
            overlap: 0.0,
            ..ApplyOptions::default()
        };
        let (out, report) = apply_model_with_report(&model, input.view(), &options).unwrap();
        assert_sums_to_mix(&out, &input);
        assert_eq!(report.evaluations, 10);

        let too_long = ApplyOptions {
            segment: Some(1.0),
            ..options
        };
        assert!(apply_model(&model, input.view(), &too_long).is_err());
    }

    #[test]
    fn test_without_split_requires_short_input() {
        let model = EvenSplit::new(300);
        let options = ApplyOptions {
            shifts: 0,
            split: false,
            ..ApplyOptions::default()
        };
        assert!(apply_model(&model, mix(250).view(), &options).is_ok());
        assert!(apply_model(&model, mix(301).view(), &options).is_err());
    }

    #[test]
    fn test_progress_reaches_completion() {
        let model = EvenSplit::new(300);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let options = ApplyOptions {
            shifts: 1,
            ..ApplyOptions::default()
        }
        .with_progress(Arc::new(move |p: f32| sink.lock().unwrap().push(p)));

        apply_model(&model, mix(1500).view(), &options).unwrap();
        let seen = log.lock().unwrap();
        assert!(seen.len() > 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[test]
    fn test_cancellation() {
        let model = EvenSplit::new(300);
        let cancel = Arc::new(AtomicBool::new(true));
        let options = ApplyOptions::default().with_cancel(cancel);
        assert!(matches!(
            apply_model(&model, mix(1000).view(), &options),
            Err(MlError::Cancelled)
        ));
    }

    #[test]
    fn test_bag_weights_select_sources() {
        let sources = StemType::standard_4();
        let members: Vec<Arc<dyn SeparationModel>> = (0..4)
            .map(|index| {
                Arc::new(OneHot {
                    sources: sources.clone(),
                    index,
                }) as Arc<dyn SeparationModel>
            })
            .collect();
        let mut weights = vec![vec![0.0; 4]; 4];
        for (i, row) in weights.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        let bag = BagOfModels::new("ft", members, Some(weights)).unwrap();

        let input = mix(700);
        let options = ApplyOptions {
            shifts: 0,
            ..ApplyOptions::default()
        };
        let out = apply_model(&bag, input.view(), &options).unwrap();
        for k in 0..4 {
            for (a, b) in out.index_axis(Axis(0), k).iter().zip(input.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_bag_members_draw_distinct_shifts() {
        let run = || {
            let members = [Arc::new(Recorder::new()), Arc::new(Recorder::new())];
            let bag = BagOfModels::new(
                "pair",
                members
                    .iter()
                    .map(|m| Arc::clone(m) as Arc<dyn SeparationModel>)
                    .collect(),
                None,
            )
            .unwrap();
            let input = Array2::from_shape_fn((2, 600), |(_, t)| (t + 1) as f32 / 600.0);
            let options = ApplyOptions {
                shifts: 2,
                seed: 7,
                ..ApplyOptions::default()
            };
            apply_model(&bag, input.view(), &options).unwrap();
            members.map(|m| m.sorted_windows())
        };

        let [first, second] = run();
        assert!(!first.is_empty());
        assert_ne!(first, second);
        assert_eq!(run(), [first, second]);
    }
}
