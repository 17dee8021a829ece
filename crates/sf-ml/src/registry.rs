//! Known pretrained variants
//!
//! Only names, stems and expected file layout; weights are provided by the
//! user (no downloading).

use crate::hdemucs::HDemucsConfig;
use crate::htdemucs::HTDemucsConfig;
use crate::loader::NativeConfig;
use crate::separation::StemType;

const FOUR_STEMS: &[StemType] = &[StemType::Drums, StemType::Bass, StemType::Other, StemType::Vocals];
const SIX_STEMS: &[StemType] = &[
    StemType::Drums,
    StemType::Bass,
    StemType::Other,
    StemType::Vocals,
    StemType::Guitar,
    StemType::Piano,
];
const TWO_STEMS: &[StemType] = &[StemType::Vocals, StemType::NoVocals];

/// Network family of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Hybrid Transformer Demucs (v4)
    HTDemucs,
    /// Hybrid Demucs (v3)
    HDemucs,
}

/// A published model variant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnownModel {
    pub name: &'static str,
    pub architecture: Architecture,
    pub description: &'static str,
    pub sources: &'static [StemType],
    /// Default weight file, or bag manifest for ensembles
    pub file_name: &'static str,
    /// Number of bag members (1 for single models)
    pub members: usize,
}

impl KnownModel {
    /// Architecture defaults for this variant
    pub fn config(&self) -> NativeConfig {
        let sources = self.sources.to_vec();
        match self.architecture {
            Architecture::HTDemucs => NativeConfig::HTDemucs(HTDemucsConfig {
                sources,
                ..HTDemucsConfig::default()
            }),
            Architecture::HDemucs => NativeConfig::HDemucs(HDemucsConfig {
                sources,
                ..HDemucsConfig::default()
            }),
        }
    }

    pub fn is_bag(&self) -> bool {
        self.members > 1
    }

    /// Specialist bags weight each member to one source
    pub fn bag_weights(&self) -> Option<Vec<Vec<f32>>> {
        if !self.is_bag() || self.members != self.sources.len() {
            return None;
        }
        Some(
            (0..self.members)
                .map(|m| (0..self.sources.len()).map(|k| if k == m { 1.0 } else { 0.0 }).collect())
                .collect(),
        )
    }
}

static KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        name: "htdemucs",
        architecture: Architecture::HTDemucs,
        description: "Hybrid Transformer Demucs v4, 4 stems",
        sources: FOUR_STEMS,
        file_name: "htdemucs.safetensors",
        members: 1,
    },
    KnownModel {
        name: "htdemucs_6s",
        architecture: Architecture::HTDemucs,
        description: "Hybrid Transformer Demucs v4, 6 stems (adds guitar and piano)",
        sources: SIX_STEMS,
        file_name: "htdemucs_6s.safetensors",
        members: 1,
    },
    KnownModel {
        name: "htdemucs_ft",
        architecture: Architecture::HTDemucs,
        description: "Bag of 4 fine-tuned Hybrid Transformer Demucs, one specialist per stem",
        sources: FOUR_STEMS,
        file_name: "htdemucs_ft.json",
        members: 4,
    },
    KnownModel {
        name: "htdemucs_2s",
        architecture: Architecture::HTDemucs,
        description: "Hybrid Transformer Demucs v4 trained for vocals / accompaniment",
        sources: TWO_STEMS,
        file_name: "htdemucs_2s.safetensors",
        members: 1,
    },
    KnownModel {
        name: "hdemucs_mmi",
        architecture: Architecture::HDemucs,
        description: "Hybrid Demucs v3 with BiLSTM and local attention, 4 stems",
        sources: FOUR_STEMS,
        file_name: "hdemucs_mmi.safetensors",
        members: 1,
    },
];

/// All known variants
pub fn known_models() -> &'static [KnownModel] {
    KNOWN_MODELS
}

/// Look up a variant by name or file stem (`htdemucs_6s.safetensors` matches `htdemucs_6s`)
pub fn find(name: &str) -> Option<&'static KnownModel> {
    let stem = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = stem.split('.').next().unwrap_or(stem);
    KNOWN_MODELS.iter().find(|m| m.name.eq_ignore_ascii_case(stem))
}
