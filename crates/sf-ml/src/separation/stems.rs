//! Stem types and output structures

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};

/// Available stem types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StemType {
    /// Drum kit (kick, snare, hats, toms, cymbals)
    Drums,
    /// Bass instruments (bass guitar, synth bass)
    Bass,
    /// Everything else (guitars, synths, strings, etc.)
    Other,
    /// Vocal content (lead, backing, harmonies)
    Vocals,
    /// Guitar (electric and acoustic), 6-source models only
    Guitar,
    /// Piano and keyboard instruments, 6-source models only
    Piano,
    /// Full mix (original)
    Mix,
    /// Everything except drums
    NoDrums,
    /// Everything except bass
    NoBass,
    /// Everything except other
    NoOther,
    /// Everything except vocals (instrumental)
    NoVocals,
    /// Everything except guitar
    NoGuitar,
    /// Everything except piano
    NoPiano,
}

impl StemType {
    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            StemType::Drums => "Drums",
            StemType::Bass => "Bass",
            StemType::Other => "Other",
            StemType::Vocals => "Vocals",
            StemType::Guitar => "Guitar",
            StemType::Piano => "Piano",
            StemType::Mix => "Mix",
            StemType::NoDrums => "No Drums",
            StemType::NoBass => "No Bass",
            StemType::NoOther => "No Other",
            StemType::NoVocals => "Instrumental",
            StemType::NoGuitar => "No Guitar",
            StemType::NoPiano => "No Piano",
        }
    }

    /// Get short name for file naming
    pub fn short_name(&self) -> &'static str {
        match self {
            StemType::Drums => "drums",
            StemType::Bass => "bass",
            StemType::Other => "other",
            StemType::Vocals => "vocals",
            StemType::Guitar => "guitar",
            StemType::Piano => "piano",
            StemType::Mix => "mix",
            StemType::NoDrums => "no_drums",
            StemType::NoBass => "no_bass",
            StemType::NoOther => "no_other",
            StemType::NoVocals => "no_vocals",
            StemType::NoGuitar => "no_guitar",
            StemType::NoPiano => "no_piano",
        }
    }

    /// The "everything but this" counterpart of a source
    pub fn complement(&self) -> Option<StemType> {
        match self {
            StemType::Drums => Some(StemType::NoDrums),
            StemType::Bass => Some(StemType::NoBass),
            StemType::Other => Some(StemType::NoOther),
            StemType::Vocals => Some(StemType::NoVocals),
            StemType::Guitar => Some(StemType::NoGuitar),
            StemType::Piano => Some(StemType::NoPiano),
            _ => None,
        }
    }

    /// All parseable stem types
    pub fn all() -> [StemType; 13] {
        [
            StemType::Drums,
            StemType::Bass,
            StemType::Other,
            StemType::Vocals,
            StemType::Guitar,
            StemType::Piano,
            StemType::Mix,
            StemType::NoDrums,
            StemType::NoBass,
            StemType::NoOther,
            StemType::NoVocals,
            StemType::NoGuitar,
            StemType::NoPiano,
        ]
    }

    /// Source order of 4-source models
    pub fn standard_4() -> Vec<StemType> {
        vec![
            StemType::Drums,
            StemType::Bass,
            StemType::Other,
            StemType::Vocals,
        ]
    }

    /// Source order of 6-source models
    pub fn extended_6() -> Vec<StemType> {
        vec![
            StemType::Drums,
            StemType::Bass,
            StemType::Other,
            StemType::Vocals,
            StemType::Guitar,
            StemType::Piano,
        ]
    }

    /// Source order of 2-source vocal models
    pub fn vocals_2() -> Vec<StemType> {
        vec![StemType::Vocals, StemType::NoVocals]
    }

    /// Default source order for a model with `count` outputs
    pub fn for_source_count(count: usize) -> MlResult<Vec<StemType>> {
        match count {
            2 => Ok(Self::vocals_2()),
            4 => Ok(Self::standard_4()),
            6 => Ok(Self::extended_6()),
            n => Err(MlError::InvalidConfig(format!(
                "no default source names for a {n}-source model"
            ))),
        }
    }
}

impl fmt::Display for StemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for StemType {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        StemType::all()
            .into_iter()
            .find(|t| t.short_name() == wanted)
            .ok_or_else(|| MlError::InvalidConfig(format!("unknown stem: {s}")))
    }
}

/// Single stem output
#[derive(Debug, Clone)]
pub struct StemOutput {
    /// Stem type
    pub stem_type: StemType,

    /// Audio data (interleaved)
    pub audio: Vec<f32>,

    /// Number of channels
    pub channels: usize,

    /// Sample rate
    pub sample_rate: u32,

    /// Level metrics
    pub metrics: StemMetrics,
}

impl StemOutput {
    /// Create new stem output, computing its level metrics
    pub fn new(stem_type: StemType, audio: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        let mut stem = Self {
            stem_type,
            audio,
            channels,
            sample_rate,
            metrics: StemMetrics::default(),
        };
        stem.metrics.peak = stem.peak();
        stem.metrics.rms = stem.rms();
        stem
    }

    /// Frames per channel
    pub fn frames(&self) -> usize {
        self.audio.len() / self.channels.max(1)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Get one channel (deinterleaved)
    pub fn channel(&self, ch: usize) -> Vec<f32> {
        if self.channels == 1 {
            return self.audio.clone();
        }
        self.audio
            .iter()
            .skip(ch)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// Convert to mono (average channels)
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.audio.clone();
        }
        self.audio
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect()
    }

    /// Compute RMS level
    pub fn rms(&self) -> f32 {
        if self.audio.is_empty() {
            return 0.0;
        }

        let sum_sq: f32 = self.audio.iter().map(|&s| s * s).sum();
        (sum_sq / self.audio.len() as f32).sqrt()
    }

    /// Compute peak level
    pub fn peak(&self) -> f32 {
        self.audio.iter().map(|&s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Multiply every sample by `gain`
    pub fn apply_gain(&mut self, gain: f32) {
        for sample in &mut self.audio {
            *sample *= gain;
        }
        self.metrics.peak = self.peak();
        self.metrics.rms = self.rms();
    }

    /// Normalize to target peak
    pub fn normalize(&mut self, target_peak: f32) {
        let current_peak = self.peak();
        if current_peak > 1e-10 {
            self.apply_gain(target_peak / current_peak);
        }
    }
}

/// Level metrics for a stem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StemMetrics {
    /// Peak absolute sample
    pub peak: f32,

    /// RMS level
    pub rms: f32,

    /// Share of the summed stem energy (0.0 - 1.0)
    pub energy_share: f32,
}

/// Collection of separated stems, in model source order
#[derive(Debug, Clone)]
pub struct StemCollection {
    stems: Vec<StemOutput>,

    /// Sample rate of every stem
    pub sample_rate: u32,

    /// Total duration in seconds
    pub duration: f64,

    /// Model used
    pub model_name: String,

    /// Processing stats
    pub stats: SeparationStats,
}

impl StemCollection {
    /// Create new stem collection
    pub fn new(sample_rate: u32, model_name: String) -> Self {
        Self {
            stems: Vec::new(),
            sample_rate,
            duration: 0.0,
            model_name,
            stats: SeparationStats::default(),
        }
    }

    /// Add a stem, replacing one of the same type
    pub fn add(&mut self, stem: StemOutput) {
        if self.duration == 0.0 {
            self.duration = stem.duration();
        }
        match self.stems.iter_mut().find(|s| s.stem_type == stem.stem_type) {
            Some(existing) => *existing = stem,
            None => self.stems.push(stem),
        }
    }

    /// Get a stem by type
    pub fn get(&self, stem_type: StemType) -> Option<&StemOutput> {
        self.stems.iter().find(|s| s.stem_type == stem_type)
    }

    /// Get mutable stem
    pub fn get_mut(&mut self, stem_type: StemType) -> Option<&mut StemOutput> {
        self.stems.iter_mut().find(|s| s.stem_type == stem_type)
    }

    /// Stems in source order
    pub fn iter(&self) -> impl Iterator<Item = &StemOutput> {
        self.stems.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StemOutput> {
        self.stems.iter_mut()
    }

    /// Get stem types present
    pub fn stem_types(&self) -> Vec<StemType> {
        self.stems.iter().map(|s| s.stem_type).collect()
    }

    /// Number of stems
    pub fn len(&self) -> usize {
        self.stems.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    /// Largest absolute sample across all stems
    pub fn peak(&self) -> f32 {
        self.stems.iter().map(|s| s.peak()).fold(0.0, f32::max)
    }

    /// Fill in each stem's share of the total energy
    pub fn update_energy_shares(&mut self) {
        let energies: Vec<f64> = self
            .stems
            .iter()
            .map(|s| s.audio.iter().map(|&v| (v as f64) * (v as f64)).sum())
            .collect();
        let total: f64 = energies.iter().sum();
        for (stem, energy) in self.stems.iter_mut().zip(energies) {
            stem.metrics.energy_share = if total > 0.0 { (energy / total) as f32 } else { 0.0 };
        }
    }

    /// Remix stems with custom gains (missing gains default to 1.0)
    pub fn remix(&self, gains: &HashMap<StemType, f32>) -> Vec<f32> {
        let Some(reference) = self.stems.first() else {
            return Vec::new();
        };

        let mut output = vec![0.0f32; reference.audio.len()];
        for stem in &self.stems {
            let gain = gains.get(&stem.stem_type).copied().unwrap_or(1.0);
            for (out, &sample) in output.iter_mut().zip(stem.audio.iter()) {
                *out += sample * gain;
            }
        }

        output
    }

    /// Get karaoke mix (everything except vocals)
    pub fn karaoke(&self) -> Vec<f32> {
        self.mix_without(StemType::Vocals)
    }

    /// Get acapella (vocals only)
    pub fn acapella(&self) -> Vec<f32> {
        let gains = self
            .stems
            .iter()
            .map(|s| (s.stem_type, if s.stem_type == StemType::Vocals { 1.0 } else { 0.0 }))
            .collect();
        self.remix(&gains)
    }

    fn mix_without(&self, excluded: StemType) -> Vec<f32> {
        let gains = self
            .stems
            .iter()
            .map(|s| (s.stem_type, if s.stem_type == excluded { 0.0 } else { 1.0 }))
            .collect();
        self.remix(&gains)
    }

    /// Reduce to `stem` and its complement (`no_<stem>`)
    pub fn two_stems(&self, stem: StemType) -> MlResult<StemCollection> {
        let selected = self.get(stem).ok_or_else(|| {
            MlError::InvalidConfig(format!(
                "stem {stem} not produced by model {}",
                self.model_name
            ))
        })?;
        let complement = stem.complement().ok_or_else(|| {
            MlError::InvalidConfig(format!("stem {stem} has no complement"))
        })?;

        let mut out = StemCollection::new(self.sample_rate, self.model_name.clone());
        out.stats = self.stats.clone();
        out.add(selected.clone());
        out.add(StemOutput::new(
            complement,
            self.mix_without(stem),
            selected.channels,
            self.sample_rate,
        ));
        out.update_energy_shares();
        Ok(out)
    }
}

/// Separation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeparationStats {
    /// Total processing time (ms)
    pub total_time_ms: u64,

    /// Number of model evaluations
    pub segments_processed: usize,

    /// Shift augmentation passes
    pub shifts: usize,

    /// Real-time factor (audio seconds per processing second)
    pub rtf: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_type() {
        assert_eq!(StemType::standard_4().len(), 4);
        assert_eq!(StemType::extended_6().len(), 6);
        assert_eq!(StemType::for_source_count(2).unwrap(), StemType::vocals_2());
        assert!(StemType::for_source_count(3).is_err());
    }

    #[test]
    fn test_stem_names_round_trip() {
        for stem in StemType::all() {
            assert_eq!(stem.short_name().parse::<StemType>().unwrap(), stem);
        }
        assert_eq!("Vocals".parse::<StemType>().unwrap(), StemType::Vocals);
        assert!("kazoo".parse::<StemType>().is_err());
        assert_eq!(StemType::Vocals.complement(), Some(StemType::NoVocals));
        assert_eq!(StemType::Mix.complement(), None);
    }

    #[test]
    fn test_stem_serde_names() {
        let json = serde_json::to_string(&StemType::NoVocals).unwrap();
        assert_eq!(json, "\"no_vocals\"");
        let parsed: StemType = serde_json::from_str("\"guitar\"").unwrap();
        assert_eq!(parsed, StemType::Guitar);
    }

    #[test]
    fn test_stem_output() {
        let stem = StemOutput::new(StemType::Piano, vec![-0.8, 0.4, 0.2, -0.2], 2, 22050);
        assert_eq!(stem.frames(), 2);
        assert!((stem.peak() - 0.8).abs() < 1e-6);
        assert!((stem.duration() - 2.0 / 22050.0).abs() < 1e-9);
        assert!(stem.metrics.rms > 0.0);
    }

    #[test]
    fn test_channel_and_mono() {
        let stem = StemOutput::new(StemType::Bass, vec![1.0, 3.0, 2.0, 4.0], 2, 44100);
        assert_eq!(stem.channel(0), vec![1.0, 2.0]);
        assert_eq!(stem.channel(1), vec![3.0, 4.0]);
        assert_eq!(stem.to_mono(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_remix_karaoke_acapella() {
        let mut stems = StemCollection::new(44100, "mix".into());
        stems.add(StemOutput::new(StemType::Drums, vec![0.2; 8], 2, 44100));
        stems.add(StemOutput::new(StemType::Vocals, vec![0.6; 8], 2, 44100));
        stems.add(StemOutput::new(StemType::Bass, vec![-0.1; 8], 2, 44100));

        // bass has no explicit gain and stays at unity
        let gains = HashMap::from([(StemType::Drums, 2.0), (StemType::Vocals, 0.0)]);
        let remixed = stems.remix(&gains);
        assert_eq!(remixed.len(), 8);
        assert!(remixed.iter().all(|&s| (s - 0.3).abs() < 1e-6));

        assert!(stems.karaoke().iter().all(|&s| (s - 0.1).abs() < 1e-6));
        assert!(stems.acapella().iter().all(|&s| (s - 0.6).abs() < 1e-6));
        assert!(StemCollection::new(44100, "empty".into()).remix(&gains).is_empty());
    }

    #[test]
    fn test_two_stems() {
        let mut collection = StemCollection::new(44100, "test".into());
        collection.add(StemOutput::new(StemType::Drums, vec![0.25; 10], 1, 44100));
        collection.add(StemOutput::new(StemType::Bass, vec![0.5; 10], 1, 44100));
        collection.add(StemOutput::new(StemType::Vocals, vec![1.0; 10], 1, 44100));

        let two = collection.two_stems(StemType::Vocals).unwrap();
        assert_eq!(two.stem_types(), vec![StemType::Vocals, StemType::NoVocals]);
        let rest = two.get(StemType::NoVocals).unwrap();
        assert!((rest.audio[3] - 0.75).abs() < 1e-6);

        let shares: f32 = two.iter().map(|s| s.metrics.energy_share).sum();
        assert!((shares - 1.0).abs() < 1e-5);

        assert!(collection.two_stems(StemType::Piano).is_err());
    }

    #[test]
    fn test_order_is_preserved() {
        let mut collection = StemCollection::new(44100, "test".into());
        for stem in StemType::standard_4() {
            collection.add(StemOutput::new(stem, vec![0.0; 4], 1, 44100));
        }
        assert_eq!(collection.stem_types(), StemType::standard_4());
    }
}
