//! Output format, clipping policy and file naming for separated stems

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sf_ml::separation::StemCollection;

use crate::config::DitheringMode;
use crate::error::{OfflineError, OfflineResult};

/// Output audio format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// WAV (PCM or float)
    Wav(WavConfig),
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Wav(WavConfig::default())
    }
}

impl OutputFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav(_) => "wav",
        }
    }

    /// Create WAV 16-bit format
    pub fn wav_16() -> Self {
        Self::Wav(WavConfig {
            bit_depth: 16,
            ..Default::default()
        })
    }

    /// Create WAV 24-bit format
    pub fn wav_24() -> Self {
        Self::Wav(WavConfig {
            bit_depth: 24,
            ..Default::default()
        })
    }

    /// Create WAV 32-bit float format
    pub fn wav_32f() -> Self {
        Self::Wav(WavConfig {
            bit_depth: 32,
            float: true,
            dithering: DitheringMode::None,
        })
    }

    pub fn validate(&self) -> OfflineResult<()> {
        match self {
            Self::Wav(config) => config.validate(),
        }
    }
}

/// WAV configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WavConfig {
    /// Bit depth (16, 24, 32)
    pub bit_depth: u8,
    /// Float format (for 32-bit)
    pub float: bool,
    /// Dithering mode (for bit depth reduction)
    pub dithering: DitheringMode,
}

impl Default for WavConfig {
    fn default() -> Self {
        Self {
            bit_depth: 16,
            float: false,
            dithering: DitheringMode::Triangular,
        }
    }
}

impl WavConfig {
    pub fn validate(&self) -> OfflineResult<()> {
        match (self.bit_depth, self.float) {
            (16 | 24 | 32, false) | (32, true) => Ok(()),
            (depth, float) => Err(OfflineError::InvalidConfig(format!(
                "unsupported WAV sample format: {depth}-bit{}",
                if float { " float" } else { "" }
            ))),
        }
    }
}

/// How stems are kept inside the integer range before writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipMode {
    /// Scale every stem by the same factor so the loudest peak fits
    #[default]
    Rescale,
    /// Hard-limit each sample to +-0.99
    Clamp,
    /// Leave samples untouched
    None,
}

const CLAMP_LIMIT: f32 = 0.99;
/// Headroom applied to the loudest peak in rescale mode
const RESCALE_HEADROOM: f32 = 1.01;

impl ClipMode {
    /// Apply to all stems together; returns the gain used by `Rescale`
    pub fn apply(self, stems: &mut StemCollection) -> f32 {
        match self {
            ClipMode::Rescale => {
                let peak = stems.peak();
                let scale = (RESCALE_HEADROOM * peak).max(1.0);
                if scale > 1.0 {
                    log::debug!("Rescaling stems by 1/{scale:.3} to avoid clipping");
                    for stem in stems.iter_mut() {
                        stem.apply_gain(1.0 / scale);
                    }
                }
                1.0 / scale
            }
            ClipMode::Clamp => {
                for stem in stems.iter_mut() {
                    for s in &mut stem.audio {
                        *s = s.clamp(-CLAMP_LIMIT, CLAMP_LIMIT);
                    }
                }
                1.0
            }
            ClipMode::None => 1.0,
        }
    }
}

impl std::str::FromStr for ClipMode {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rescale" => Ok(Self::Rescale),
            "clamp" => Ok(Self::Clamp),
            "none" => Ok(Self::None),
            other => Err(OfflineError::InvalidConfig(format!("unknown clip mode '{other}'"))),
        }
    }
}

/// Default layout: one directory per track
pub const DEFAULT_FILENAME: &str = "{track}/{stem}.{ext}";

/// Output path template with `{track}`, `{trackext}`, `{stem}` and `{ext}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilenameTemplate(String);

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self(DEFAULT_FILENAME.to_string())
    }
}

impl FilenameTemplate {
    pub fn new(template: impl Into<String>) -> OfflineResult<Self> {
        let template = FilenameTemplate(template.into());
        template.validate()?;
        Ok(template)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Every stem must land in its own file
    pub fn validate(&self) -> OfflineResult<()> {
        if !self.0.contains("{stem}") {
            return Err(OfflineError::InvalidConfig(format!(
                "filename template '{}' must contain {{stem}}",
                self.0
            )));
        }
        let path = Path::new(&self.0);
        if path.has_root()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(OfflineError::InvalidConfig(format!(
                "filename template '{}' must stay inside the output directory",
                self.0
            )));
        }
        Ok(())
    }

    /// Expand for `input` and `stem`, relative to `output_dir`
    pub fn expand(&self, output_dir: &Path, input: &Path, stem: &str, ext: &str) -> PathBuf {
        let track = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());
        let trackext = input
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let name = self
            .0
            .replace("{track}", &track)
            .replace("{trackext}", &trackext)
            .replace("{stem}", stem)
            .replace("{ext}", ext);
        output_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sf_ml::separation::{StemOutput, StemType};

    fn collection(peaks: &[f32]) -> StemCollection {
        let mut stems = StemCollection::new(44100, "test".into());
        for (stem_type, &peak) in StemType::standard_4().into_iter().zip(peaks) {
            stems.add(StemOutput::new(stem_type, vec![0.1, -peak, peak * 0.5, 0.0], 2, 44100));
        }
        stems
    }

    #[test]
    fn test_template_expansion() {
        let template = FilenameTemplate::default();
        let path = template.expand(Path::new("out"), Path::new("/music/song.flac"), "vocals", "wav");
        assert_eq!(path, PathBuf::from("out/song/vocals.wav"));

        let flat = FilenameTemplate::new("{track}_{trackext}-{stem}.{ext}").unwrap();
        let path = flat.expand(Path::new("/tmp"), Path::new("a.b.mp3"), "no_vocals", "wav");
        assert_eq!(path, PathBuf::from("/tmp/a.b_mp3-no_vocals.wav"));
    }

    #[test]
    fn test_template_requires_stem() {
        assert!(FilenameTemplate::new("{track}.{ext}").is_err());
        assert!(FilenameTemplate::new("/abs/{stem}.wav").is_err());
    }

    #[test]
    fn test_template_stays_in_output_dir() {
        assert!(FilenameTemplate::new("../{stem}.{ext}").is_err());
        assert!(FilenameTemplate::new("{track}/../../{stem}.{ext}").is_err());
        assert!(FilenameTemplate::new("./{track}/{stem}.{ext}").is_ok());
        assert!(FilenameTemplate::new("{track}..{stem}.{ext}").is_ok());

        // templates read from job files are checked too
        let parsed: FilenameTemplate = serde_json::from_str(r#""../{stem}.wav""#).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_rescale_bounds_peak() {
        let mut stems = collection(&[0.5, 2.0, 0.3, 0.1]);
        let gain = ClipMode::Rescale.apply(&mut stems);
        assert_relative_eq!(gain, 1.0 / 2.02, epsilon = 1e-6);
        assert!(stems.peak() < 1.0);
        // relative balance is kept
        let bass = stems.get(StemType::Bass).unwrap().peak();
        let drums = stems.get(StemType::Drums).unwrap().peak();
        assert_relative_eq!(bass / drums, 4.0, epsilon = 1e-4);
    }

    #[test]
    fn test_rescale_leaves_quiet_stems() {
        let mut stems = collection(&[0.5, 0.2, 0.3, 0.1]);
        assert_eq!(ClipMode::Rescale.apply(&mut stems), 1.0);
        assert!((stems.peak() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_and_none() {
        let mut stems = collection(&[1.5, 0.2, 0.3, 0.1]);
        ClipMode::Clamp.apply(&mut stems);
        assert!((stems.peak() - 0.99).abs() < 1e-6);

        let mut stems = collection(&[1.5, 0.2, 0.3, 0.1]);
        ClipMode::None.apply(&mut stems);
        assert!((stems.peak() - 1.5).abs() < 1e-6);

        assert_eq!("CLAMP".parse::<ClipMode>().unwrap(), ClipMode::Clamp);
        assert!("soft".parse::<ClipMode>().is_err());
    }

    #[test]
    fn test_wav_config_validation() {
        assert!(OutputFormat::wav_16().validate().is_ok());
        assert!(OutputFormat::wav_24().validate().is_ok());
        assert!(OutputFormat::wav_32f().validate().is_ok());
        let bad = OutputFormat::Wav(WavConfig {
            bit_depth: 8,
            ..Default::default()
        });
        assert!(bad.validate().is_err());
    }
}
