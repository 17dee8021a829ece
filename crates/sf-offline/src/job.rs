//! Separation job definitions

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sf_ml::separation::{SeparationStats, StemType};

use crate::error::{OfflineError, OfflineResult};
use crate::formats::{ClipMode, FilenameTemplate, OutputFormat};

/// Unique job identifier
pub type JobId = u64;

/// One input file to separate into stems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationJob {
    /// Unique job ID
    pub id: JobId,

    /// Input file path
    pub input_path: PathBuf,

    /// Root directory for the stem files
    pub output_dir: PathBuf,

    /// Stem file naming, relative to `output_dir`
    pub filename: FilenameTemplate,

    /// Output format
    pub format: OutputFormat,

    /// Clipping policy applied to all stems together
    pub clip_mode: ClipMode,

    /// Only write this stem and its complement
    pub two_stems: Option<StemType>,

    /// Resample stems back to the input rate instead of the model rate
    pub keep_input_rate: bool,

    /// Display name
    pub name: String,
}

impl SeparationJob {
    /// Create new job builder
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }

    /// Validate job configuration
    pub fn validate(&self) -> OfflineResult<()> {
        if !self.input_path.exists() {
            return Err(OfflineError::InputNotFound(self.input_path.display().to_string()));
        }
        if self.output_dir.exists() && !self.output_dir.is_dir() {
            return Err(OfflineError::WriteError(format!(
                "Output path is not a directory: {}",
                self.output_dir.display()
            )));
        }
        if let Some(stem) = self.two_stems {
            if stem.complement().is_none() {
                return Err(OfflineError::InvalidConfig(format!("{stem} cannot be used for two-stem output")));
            }
        }
        self.filename.validate()?;
        self.format.validate()
    }
}

/// Job builder for fluent API
#[derive(Debug, Default)]
pub struct JobBuilder {
    input_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    filename: FilenameTemplate,
    format: OutputFormat,
    clip_mode: ClipMode,
    two_stems: Option<StemType>,
    keep_input_rate: bool,
    name: Option<String>,
}

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set input file
    pub fn input<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.input_path = Some(path.into());
        self
    }

    /// Set output directory (default `separated`)
    pub fn output_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    pub fn filename(mut self, template: FilenameTemplate) -> Self {
        self.filename = template;
        self
    }

    /// Set output format
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn clip_mode(mut self, mode: ClipMode) -> Self {
        self.clip_mode = mode;
        self
    }

    /// Write `stem` and `no_<stem>` only
    pub fn two_stems(mut self, stem: StemType) -> Self {
        self.two_stems = Some(stem);
        self
    }

    pub fn keep_input_rate(mut self, keep: bool) -> Self {
        self.keep_input_rate = keep;
        self
    }

    /// Set display name
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the job
    pub fn build(self) -> OfflineResult<SeparationJob> {
        let input_path = self
            .input_path
            .ok_or_else(|| OfflineError::InvalidConfig("Input path is required".to_string()))?;

        let id = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let name = self.name.unwrap_or_else(|| {
            input_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("Job {}", id))
        });

        Ok(SeparationJob {
            id,
            input_path,
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from("separated")),
            filename: self.filename,
            format: self.format,
            clip_mode: self.clip_mode,
            two_stems: self.two_stems,
            keep_input_rate: self.keep_input_rate,
            name,
        })
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in queue
    Pending,
    /// Currently processing
    Processing,
    /// Completed successfully
    Completed,
    /// Failed with error
    Failed,
    /// Cancelled by user
    Cancelled,
}

/// One written stem file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StemFile {
    pub stem: StemType,
    pub path: PathBuf,
    /// Bytes written
    pub size: u64,
    /// Peak level after clipping (dBFS)
    pub peak_db: f64,
}

/// Job completion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Job ID
    pub job_id: JobId,
    /// Final status
    pub status: JobStatus,
    /// Written stem files (if successful)
    pub outputs: Vec<StemFile>,
    /// Processing duration
    pub duration: Duration,
    /// Model statistics
    pub stats: Option<SeparationStats>,
    /// Error message (if failed)
    pub error: Option<String>,
}

impl JobResult {
    /// Create successful result
    pub fn success(job_id: JobId, outputs: Vec<StemFile>, duration: Duration, stats: SeparationStats) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            outputs,
            duration,
            stats: Some(stats),
            error: None,
        }
    }

    /// Create failed result
    pub fn failure(job_id: JobId, error: String, duration: Duration) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            outputs: Vec::new(),
            duration,
            stats: None,
            error: Some(error),
        }
    }

    /// Create cancelled result
    pub fn cancelled(job_id: JobId, duration: Duration) -> Self {
        Self {
            job_id,
            status: JobStatus::Cancelled,
            outputs: Vec::new(),
            duration,
            stats: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
