//! StemForge command line
//!
//! Usage:
//!   stemforge separate song.flac -m models/htdemucs.safetensors   - Split into stems
//!   stemforge inspect models/htdemucs.safetensors                 - Print model info
//!   stemforge probe song.flac                                     - Print audio file info
//!
//! Logging goes through `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use sf_ml::{ModelLoader, SeparationConfig, StemType};
use sf_offline::{
    AudioDecoder, BatchEvent, BatchProcessor, ClipMode, FilenameTemplate, JobResult, OfflineConfig, OutputFormat,
    SeparationJob,
};

#[derive(Parser)]
#[command(name = "stemforge", version, about = "Music source separation with HTDemucs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Separate audio files into stems
    Separate(SeparateArgs),
    /// Print model configuration and validate its tensors
    Inspect {
        /// Model file (.safetensors, .onnx or bag .json)
        model: PathBuf,
    },
    /// Print audio file information
    Probe {
        /// Audio files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum QualityArg {
    Fast,
    Default,
    High,
    Ultra,
}

#[derive(Args)]
struct SeparateArgs {
    /// Input audio files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Model file (.safetensors, .onnx or bag .json)
    #[arg(short, long)]
    model: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "separated")]
    out: PathBuf,

    /// Output path template: {track}, {trackext}, {stem}, {ext}
    #[arg(long)]
    filename: Option<String>,

    /// Quality preset, individual flags override it
    #[arg(short, long, value_enum)]
    quality: Option<QualityArg>,

    /// Random shift passes
    #[arg(long)]
    shifts: Option<usize>,

    /// Overlap between segments
    #[arg(long)]
    overlap: Option<f32>,

    /// Segment length in seconds
    #[arg(long)]
    segment: Option<f32>,

    /// Parallel segment workers
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Files processed at once
    #[arg(long)]
    parallel_files: Option<usize>,

    /// Only write this stem and its complement (e.g. vocals)
    #[arg(long)]
    two_stems: Option<String>,

    /// Write 24-bit WAV
    #[arg(long, conflicts_with = "float32")]
    int24: bool,

    /// Write 32-bit float WAV
    #[arg(long)]
    float32: bool,

    /// rescale, clamp or none
    #[arg(long)]
    clip_mode: Option<String>,

    /// Keep the input sample rate instead of the model's
    #[arg(long)]
    keep_rate: bool,

    /// JSON run configuration, flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Contents of `--config`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    separation: SeparationConfig,
    offline: OfflineConfig,
    format: OutputFormat,
    clip_mode: ClipMode,
    filename: Option<FilenameTemplate>,
    two_stems: Option<StemType>,
}

impl RunConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Separate(args) => separate(args),
        Commands::Inspect { model } => inspect(&model),
        Commands::Probe { files } => probe(&files),
    }
}

/// Layer command-line flags over `run`: the quality preset replaces the
/// separation settings, then individual flags override single fields
fn apply_flags(run: &mut RunConfig, args: &SeparateArgs) -> Result<()> {
    if let Some(quality) = args.quality {
        run.separation = match quality {
            QualityArg::Fast => SeparationConfig::fast(),
            QualityArg::Default => SeparationConfig::default(),
            QualityArg::High => SeparationConfig::high_quality(),
            QualityArg::Ultra => SeparationConfig::ultra(),
        };
    }
    if let Some(shifts) = args.shifts {
        run.separation.shifts = shifts;
    }
    if let Some(overlap) = args.overlap {
        run.separation.overlap = overlap;
    }
    if let Some(segment) = args.segment {
        run.separation.segment = Some(segment);
    }
    if let Some(jobs) = args.jobs {
        run.separation.num_workers = jobs;
    }
    if let Some(files) = args.parallel_files {
        run.offline.max_concurrent_jobs = files;
    }
    if args.keep_rate {
        run.offline.keep_input_rate = true;
    }
    if args.int24 {
        run.format = OutputFormat::wav_24();
    } else if args.float32 {
        run.format = OutputFormat::wav_32f();
    }
    if let Some(mode) = &args.clip_mode {
        run.clip_mode = mode.parse::<ClipMode>()?;
    }
    if let Some(template) = &args.filename {
        run.filename = Some(FilenameTemplate::new(template.as_str())?);
    }
    if let Some(stem) = &args.two_stems {
        run.two_stems = Some(stem.parse::<StemType>()?);
    }
    if let Some(template) = &run.filename {
        template.validate()?;
    }
    run.separation.validate()?;
    Ok(())
}

fn separate(args: SeparateArgs) -> Result<()> {
    let mut run = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    apply_flags(&mut run, &args)?;
    let filename = run.filename.clone().unwrap_or_default();
    let two_stems = run.two_stems;

    let model = ModelLoader::load(&args.model).with_context(|| format!("loading model {}", args.model.display()))?;
    log::info!(
        "Model {}: {} at {} Hz",
        model.name(),
        model
            .sources()
            .iter()
            .map(|s| s.short_name())
            .collect::<Vec<_>>()
            .join(", "),
        model.samplerate()
    );
    if let Some(stem) = two_stems {
        if !model.sources().contains(&stem) {
            bail!("model {} does not produce {stem}", model.name());
        }
    }

    let jobs = args
        .inputs
        .iter()
        .map(|input| {
            let mut builder = SeparationJob::builder()
                .input(input)
                .output_dir(&args.out)
                .filename(filename.clone())
                .format(run.format.clone())
                .clip_mode(run.clip_mode);
            if let Some(stem) = two_stems {
                builder = builder.two_stems(stem);
            }
            builder.build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let processor = BatchProcessor::new(model, run.separation, run.offline).with_events(tx);

    let reporter = thread::spawn(move || {
        for event in rx {
            match event {
                BatchEvent::Started { name, .. } => log::info!("Separating {name}"),
                BatchEvent::Finished(result) => report(&result),
            }
        }
    });
    let results = processor.process_all(&jobs);
    drop(processor);
    if reporter.join().is_err() {
        log::warn!("progress reporter panicked");
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        bail!("{failed} of {} files failed", results.len());
    }
    Ok(())
}

fn report(result: &JobResult) {
    if result.is_success() {
        log::info!(
            "Job {} done in {:.1}s: {} stems",
            result.job_id,
            result.duration.as_secs_f64(),
            result.outputs.len()
        );
        for output in &result.outputs {
            log::info!("  {} -> {} ({:.1} dBFS peak)", output.stem, output.path.display(), output.peak_db);
        }
    } else {
        log::error!(
            "Job {} {:?}: {}",
            result.job_id,
            result.status,
            result.error.as_deref().unwrap_or("cancelled")
        );
    }
}

fn inspect(model: &Path) -> Result<()> {
    let info = ModelLoader::inspect(model).with_context(|| format!("inspecting {}", model.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    if !info.unused_tensors.is_empty() {
        log::warn!("{} tensors are not used by the model", info.unused_tensors.len());
    }
    Ok(())
}

fn probe(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let info = AudioDecoder::probe(file).with_context(|| format!("probing {}", file.display()))?;
        println!(
            "{}: {} {} Hz, {} ch, {}",
            info.path.display(),
            info.format,
            info.sample_rate,
            info.channels,
            info.duration_str()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separate_args(argv: &[&str]) -> SeparateArgs {
        let mut full = vec!["stemforge", "separate", "song.wav", "-m", "htdemucs.safetensors"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Separate(args) => args,
            _ => panic!("expected the separate subcommand"),
        }
    }

    fn flags(argv: &[&str]) -> Result<RunConfig> {
        let mut run = RunConfig::default();
        apply_flags(&mut run, &separate_args(argv))?;
        Ok(run)
    }

    #[test]
    fn test_defaults() {
        let run = flags(&[]).unwrap();
        assert_eq!(run.separation, SeparationConfig::default());
        assert_eq!(run.format, OutputFormat::default());
        assert_eq!(run.clip_mode, ClipMode::Rescale);
        assert!(run.filename.is_none());
        assert!(run.two_stems.is_none());
    }

    #[test]
    fn test_flags_override_preset() {
        let run = flags(&["-q", "ultra", "--shifts", "2", "--overlap", "0.1", "--segment", "4.5", "-j", "3"]).unwrap();
        let ultra = SeparationConfig::ultra();
        assert_eq!(run.separation.quality, ultra.quality);
        assert_eq!(run.separation.transition_power, ultra.transition_power);
        assert_eq!(run.separation.shifts, 2);
        assert_eq!(run.separation.overlap, 0.1);
        assert_eq!(run.separation.segment, Some(4.5));
        assert_eq!(run.separation.num_workers, 3);
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{
                "separation": {"shifts": 5, "overlap": 0.5},
                "offline": {"max_concurrent_jobs": 4},
                "clip_mode": "clamp",
                "filename": "{track}_{stem}.{ext}",
                "two_stems": "drums"
            }"#,
        )
        .unwrap();

        let mut run = RunConfig::from_file(&path).unwrap();
        apply_flags(&mut run, &separate_args(&["--shifts", "1", "--float32", "--keep-rate"])).unwrap();
        assert_eq!(run.separation.shifts, 1);
        // untouched file values survive
        assert_eq!(run.separation.overlap, 0.5);
        assert_eq!(run.offline.max_concurrent_jobs, 4);
        assert!(run.offline.keep_input_rate);
        assert_eq!(run.clip_mode, ClipMode::Clamp);
        assert_eq!(run.format, OutputFormat::wav_32f());
        assert_eq!(run.filename.as_ref().map(|t| t.as_str()), Some("{track}_{stem}.{ext}"));
        assert_eq!(run.two_stems, Some(StemType::Drums));

        // a quality preset replaces the file's separation block
        let mut run = RunConfig::from_file(&path).unwrap();
        apply_flags(&mut run, &separate_args(&["-q", "fast"])).unwrap();
        assert_eq!(run.separation.shifts, SeparationConfig::fast().shifts);
    }

    #[test]
    fn test_output_flags() {
        let run = flags(&["--int24", "--clip-mode", "none", "--two-stems", "vocals", "--filename", "{stem}.{ext}"]).unwrap();
        assert_eq!(run.format, OutputFormat::wav_24());
        assert_eq!(run.clip_mode, ClipMode::None);
        assert_eq!(run.two_stems, Some(StemType::Vocals));
        assert_eq!(run.filename.unwrap().as_str(), "{stem}.{ext}");
    }

    #[test]
    fn test_invalid_flags() {
        assert!(flags(&["--clip-mode", "soft"]).is_err());
        assert!(flags(&["--two-stems", "kazoo"]).is_err());
        assert!(flags(&["--filename", "{track}.{ext}"]).is_err());
        assert!(flags(&["--filename", "../{stem}.{ext}"]).is_err());
        assert!(flags(&["--overlap", "0.99"]).is_err());
        assert!(Cli::try_parse_from(["stemforge", "separate", "a.wav", "-m", "m", "--int24", "--float32"]).is_err());
        assert!(Cli::try_parse_from(["stemforge", "separate", "-m", "m"]).is_err());
    }
}
