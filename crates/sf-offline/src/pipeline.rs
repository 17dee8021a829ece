//! Main offline separation pipeline
//!
//! Orchestrates one input file end to end:
//! 1. Load and decode the source audio
//! 2. Match the model's channel count and sample rate
//! 3. Separate into stems
//! 4. Reduce to two stems (optional) and apply the clip mode
//! 5. Resample stems back to the input rate (optional)
//! 6. Encode and write one file per stem

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sf_ml::separation::{
    SeparationConfig, SeparationModel, SeparationStats, Separator, SourceSeparator, StemCollection, StemType,
};
use sf_ml::MlError;
use tokio::sync::watch;

use crate::buffer::AudioBuffer;
use crate::config::OfflineConfig;
use crate::decoder::AudioDecoder;
use crate::encoder::create_encoder;
use crate::error::{OfflineError, OfflineResult};
use crate::job::{JobId, JobResult, SeparationJob, StemFile};
use crate::resample::Resampler;

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PipelineState {
    #[default]
    Idle,
    Loading,
    Resampling,
    Separating,
    Encoding,
    Writing,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineState {
    /// Overall progress range covered by this stage
    fn span(self) -> (f64, f64) {
        match self {
            PipelineState::Idle => (0.0, 0.0),
            PipelineState::Loading => (0.0, 0.05),
            PipelineState::Resampling => (0.05, 0.1),
            PipelineState::Separating => (0.1, 0.9),
            PipelineState::Encoding => (0.9, 0.95),
            PipelineState::Writing => (0.95, 1.0),
            PipelineState::Complete => (1.0, 1.0),
            PipelineState::Failed | PipelineState::Cancelled => (0.0, 0.0),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE PROGRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Detailed pipeline progress tracking
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineProgress {
    pub state: PipelineState,
    pub job_id: Option<JobId>,
    /// 0.0 - 1.0 within current stage
    pub stage_progress: f64,
    /// 0.0 - 1.0 total
    pub overall_progress: f64,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
}

/// State shared with the separator's progress callback
struct Shared {
    state: RwLock<PipelineState>,
    job_id: RwLock<Option<JobId>>,
    /// f32 bits of the current stage fraction
    stage_progress: AtomicU32,
    cancelled: Arc<AtomicBool>,
    start_time: RwLock<Option<Instant>>,
    progress_tx: watch::Sender<PipelineProgress>,
}

impl Shared {
    fn snapshot(&self) -> PipelineProgress {
        let state = *self.state.read();
        let stage_progress = f32::from_bits(self.stage_progress.load(Ordering::Relaxed)) as f64;
        let (start, end) = state.span();
        let overall_progress = start + (end - start) * stage_progress;

        let elapsed_ms = self
            .start_time
            .read()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let estimated_remaining_ms = if overall_progress > 0.01 && elapsed_ms > 0 && state != PipelineState::Complete {
            let total_estimated = (elapsed_ms as f64 / overall_progress) as u64;
            Some(total_estimated.saturating_sub(elapsed_ms))
        } else {
            None
        };

        PipelineProgress {
            state,
            job_id: *self.job_id.read(),
            stage_progress,
            overall_progress,
            elapsed_ms,
            estimated_remaining_ms,
        }
    }

    fn publish(&self) {
        self.progress_tx.send_replace(self.snapshot());
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
        self.stage_progress.store(0f32.to_bits(), Ordering::Relaxed);
        self.publish();
    }

    fn set_stage_progress(&self, fraction: f32) {
        self.stage_progress
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.publish();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn elapsed(&self) -> Duration {
        self.start_time.read().map(|t| t.elapsed()).unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEPARATION PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Decode, separate and write stems for one job at a time
pub struct SeparationPipeline {
    config: OfflineConfig,
    separator: Separator,
    resampler: Resampler,
    shared: Arc<Shared>,
    // serialises jobs on one pipeline
    busy: parking_lot::Mutex<()>,
}

impl SeparationPipeline {
    /// Create a pipeline around a loaded model
    pub fn new(
        model: Arc<dyn SeparationModel>,
        separation: SeparationConfig,
        config: OfflineConfig,
    ) -> OfflineResult<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (progress_tx, _) = watch::channel(PipelineProgress::default());
        let shared = Arc::new(Shared {
            state: RwLock::new(PipelineState::Idle),
            job_id: RwLock::new(None),
            stage_progress: AtomicU32::new(0),
            cancelled: Arc::clone(&cancelled),
            start_time: RwLock::new(None),
            progress_tx,
        });

        let callback_shared = Arc::clone(&shared);
        let separator = Separator::new(model, separation)?
            .with_cancel_flag(cancelled)
            .with_progress(Arc::new(move |fraction: f32| callback_shared.set_stage_progress(fraction)));

        Ok(Self {
            resampler: Resampler::new(config.src_quality),
            config,
            separator,
            shared,
            busy: parking_lot::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn separator(&self) -> &Separator {
        &self.separator
    }

    /// Cancel processing
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Get current state
    pub fn state(&self) -> PipelineState {
        *self.shared.state.read()
    }

    /// Get progress
    pub fn progress(&self) -> PipelineProgress {
        self.shared.snapshot()
    }

    /// Observe progress updates
    pub fn subscribe(&self) -> watch::Receiver<PipelineProgress> {
        self.shared.progress_tx.subscribe()
    }

    /// Process a single job
    pub fn process_job(&self, job: &SeparationJob) -> OfflineResult<JobResult> {
        let _guard = self.busy.lock();
        self.shared.cancelled.store(false, Ordering::SeqCst);
        *self.shared.start_time.write() = Some(Instant::now());
        *self.shared.job_id.write() = Some(job.id);

        match self.run(job) {
            Ok(Some((files, stats))) => {
                self.shared.set_state(PipelineState::Complete);
                log::info!("Job {} ({}) wrote {} stems", job.id, job.name, files.len());
                Ok(JobResult::success(job.id, files, self.shared.elapsed(), stats))
            }
            Ok(None) | Err(OfflineError::Cancelled) | Err(OfflineError::Ml(MlError::Cancelled)) => {
                self.shared.set_state(PipelineState::Cancelled);
                log::info!("Job {} cancelled", job.id);
                Ok(JobResult::cancelled(job.id, self.shared.elapsed()))
            }
            Err(e) => {
                self.shared.set_state(PipelineState::Failed);
                log::error!("Job {} failed: {}", job.id, e);
                Err(e)
            }
        }
    }

    /// Stages; `None` when cancelled between stages
    fn run(&self, job: &SeparationJob) -> OfflineResult<Option<(Vec<StemFile>, SeparationStats)>> {
        job.validate()?;
        let model = self.separator.model();

        // Step 1: Load audio
        self.shared.set_state(PipelineState::Loading);
        let source = AudioDecoder::decode(&job.input_path)?;
        if source.is_empty() {
            return Err(OfflineError::ReadError(format!("{} contains no audio", job.input_path.display())));
        }
        let input_rate = source.sample_rate;
        if self.shared.is_cancelled() {
            return Ok(None);
        }

        // Step 2: Channel layout and sample rate
        self.shared.set_state(PipelineState::Resampling);
        let mut mix = source.with_channels(model.audio_channels())?;
        if mix.sample_rate != model.samplerate() {
            mix = self.resampler.process(&mix, model.samplerate())?;
        }
        if self.shared.is_cancelled() {
            return Ok(None);
        }

        // Step 3: Separate
        self.shared.set_state(PipelineState::Separating);
        let mut stems = self.separator.separate(&mix.samples, mix.channels, mix.sample_rate)?;
        if let Some(stem) = job.two_stems {
            stems = stems.two_stems(stem)?;
        }
        job.clip_mode.apply(&mut stems);
        if self.shared.is_cancelled() {
            return Ok(None);
        }

        // Step 4: Encode
        self.shared.set_state(PipelineState::Encoding);
        let target_rate = if job.keep_input_rate || self.config.keep_input_rate {
            input_rate
        } else {
            model.samplerate()
        };
        let buffers = self.stem_buffers(&stems, target_rate)?;
        let encoder = create_encoder(&job.format);

        // Step 5: Write
        self.shared.set_state(PipelineState::Writing);
        let count = buffers.len();
        let mut outputs = Vec::with_capacity(count);
        for (i, (stem, buffer)) in buffers.into_iter().enumerate() {
            if self.shared.is_cancelled() {
                return Ok(None);
            }
            let path = job
                .filename
                .expand(&job.output_dir, &job.input_path, stem.short_name(), encoder.extension());
            let size = encoder.write_file(&buffer, &path)?;
            log::debug!("Wrote {} ({} bytes)", path.display(), size);
            outputs.push(StemFile {
                stem,
                path,
                size,
                peak_db: buffer.peak_db(),
            });
            self.shared.set_stage_progress((i + 1) as f32 / count as f32);
        }

        Ok(Some((outputs, stems.stats.clone())))
    }

    fn stem_buffers(
        &self,
        stems: &StemCollection,
        target_rate: u32,
    ) -> OfflineResult<Vec<(StemType, AudioBuffer)>> {
        stems
            .iter()
            .map(|stem| {
                let buffer = AudioBuffer {
                    samples: stem.audio.clone(),
                    channels: stem.channels,
                    sample_rate: stem.sample_rate,
                };
                let buffer = if buffer.sample_rate != target_rate {
                    self.resampler.process(&buffer, target_rate)?
                } else {
                    buffer
                };
                Ok((stem.stem_type, buffer))
            })
            .collect()
    }

    /// Run a job on tokio's blocking pool
    pub async fn process_job_async(self: Arc<Self>, job: SeparationJob) -> OfflineResult<JobResult> {
        tokio::task::spawn_blocking(move || self.process_job(&job))
            .await
            .map_err(|e| OfflineError::ProcessingFailed(format!("separation task failed: {e}")))?
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BATCH PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Batch progress notification
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started { job_id: JobId, name: String },
    Finished(JobResult),
}

/// Batch processor for multiple jobs sharing one model
pub struct BatchProcessor {
    model: Arc<dyn SeparationModel>,
    separation: SeparationConfig,
    config: OfflineConfig,
    max_parallel: usize,
    events: Option<crossbeam_channel::Sender<BatchEvent>>,
}

impl BatchProcessor {
    /// Create new batch processor
    pub fn new(model: Arc<dyn SeparationModel>, separation: SeparationConfig, config: OfflineConfig) -> Self {
        let max_parallel = match config.max_concurrent_jobs {
            0 => rayon::current_num_threads(),
            n => n,
        };
        Self {
            model,
            separation,
            config,
            max_parallel,
            events: None,
        }
    }

    /// Set max parallel jobs
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    /// Receive a start and a finish event for every job
    pub fn with_events(mut self, events: crossbeam_channel::Sender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            // a dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }

    fn process_one(&self, job: &SeparationJob) -> JobResult {
        self.emit(BatchEvent::Started {
            job_id: job.id,
            name: job.name.clone(),
        });
        let start = Instant::now();
        let result = SeparationPipeline::new(Arc::clone(&self.model), self.separation.clone(), self.config.clone())
            .and_then(|pipeline| pipeline.process_job(job))
            .unwrap_or_else(|e| JobResult::failure(job.id, e.to_string(), start.elapsed()));
        self.emit(BatchEvent::Finished(result.clone()));
        result
    }

    /// Process all jobs in parallel; results keep the input order
    pub fn process_all(&self, jobs: &[SeparationJob]) -> Vec<JobResult> {
        let run = || jobs.par_iter().map(|job| self.process_one(job)).collect();

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_parallel)
            .thread_name(|i| format!("sf-batch-{i}"))
            .build()
        {
            Ok(pool) => pool.install(run),
            Err(e) => {
                log::warn!("Batch pool unavailable ({e}), using the global pool");
                run()
            }
        }
    }
}
