//! Hybrid Demucs (v3) hyper-parameters
//!
//! Same sidecar conventions as [`HTDemucsConfig`](crate::htdemucs::HTDemucsConfig):
//! PyTorch training names, missing keys fall back to the `hdemucs_mmi` values.

use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};
use crate::htdemucs::layers::{Branch, DConvOptions, LayerGeometry};
use crate::separation::StemType;
use crate::weights::{ParamInit, ParamSpec, WeightStore};

/// Hybrid Demucs configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HDemucsConfig {
    pub sources: Vec<StemType>,
    pub audio_channels: usize,
    pub samplerate: u32,
    /// Inference window in seconds
    pub segment: f32,

    pub channels: usize,
    pub growth: usize,
    pub nfft: usize,
    pub cac: bool,
    pub depth: usize,
    pub kernel_size: usize,
    pub stride: usize,
    /// Stride of the layers below the branch merge
    pub time_stride: usize,
    pub context: usize,
    pub context_enc: usize,
    pub rewrite: bool,

    pub freq_emb: f32,
    pub emb_scale: f32,

    pub norm_starts: usize,
    pub norm_groups: usize,

    /// Residual branch placement: bit 0 encoder, bit 1 decoder
    pub dconv_mode: u8,
    pub dconv_depth: usize,
    pub dconv_comp: usize,
    /// First level with local attention in its residual branch
    pub dconv_attn: usize,
    /// First level with a BiLSTM in its residual branch
    pub dconv_lstm: usize,
    pub dconv_init: f32,
}

impl Default for HDemucsConfig {
    fn default() -> Self {
        Self {
            sources: StemType::standard_4(),
            audio_channels: 2,
            samplerate: 44100,
            segment: 7.8,
            channels: 48,
            growth: 2,
            nfft: 4096,
            cac: true,
            depth: 6,
            kernel_size: 8,
            stride: 4,
            time_stride: 2,
            context: 1,
            context_enc: 0,
            rewrite: true,
            freq_emb: 0.2,
            emb_scale: 10.0,
            norm_starts: 4,
            norm_groups: 4,
            dconv_mode: 1,
            dconv_depth: 2,
            dconv_comp: 4,
            dconv_attn: 4,
            dconv_lstm: 4,
            dconv_init: 1e-3,
        }
    }
}

/// Layers of one depth level
#[derive(Debug, Clone, PartialEq)]
pub struct HybridLevel {
    pub index: usize,
    /// Spectral rows entering the level, 1 once the branches are merged
    pub freqs: usize,
    pub encoder: LayerGeometry,
    pub decoder: LayerGeometry,
    /// Waveform layers exist only while the spectral branch has rows.
    /// At the merge level both are empty and only resample.
    pub tencoder: Option<LayerGeometry>,
    pub tdecoder: Option<LayerGeometry>,
}

impl HybridLevel {
    /// The spectral layer collapses the remaining rows into one
    pub fn is_merge(&self) -> bool {
        self.tencoder.is_some_and(|g| g.empty)
    }
}

impl HDemucsConfig {
    /// Small architecture used by tests
    pub fn tiny() -> Self {
        Self {
            samplerate: 8000,
            segment: 0.5,
            channels: 4,
            nfft: 256,
            depth: 4,
            dconv_comp: 2,
            norm_starts: 2,
            dconv_attn: 2,
            dconv_lstm: 2,
            ..Self::default()
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn hop_length(&self) -> usize {
        self.nfft / 4
    }

    pub fn training_length(&self) -> usize {
        (self.segment as f64 * self.samplerate as f64) as usize
    }

    pub fn encoder_dconv(&self) -> bool {
        self.dconv_mode & 1 != 0
    }

    pub fn decoder_dconv(&self) -> bool {
        self.dconv_mode & 2 != 0
    }

    /// Rows of the frequency embedding, added after the first encoder
    pub fn freq_emb_rows(&self) -> usize {
        let freqs = self.nfft / 2;
        if freqs <= self.kernel_size { 1 } else { freqs / self.stride }
    }

    /// Layer plan, outermost level first
    pub fn levels(&self) -> Vec<HybridLevel> {
        let mut chin = self.audio_channels;
        let mut chin_z = 2 * chin;
        let mut chout = self.channels;
        let mut chout_z = self.channels;
        let mut freqs = self.nfft / 2;

        let mut levels = Vec::with_capacity(self.depth);
        for index in 0..self.depth {
            let freq = freqs > 1;
            let (mut kernel, stride) = if freq {
                (self.kernel_size, self.stride)
            } else {
                (2 * self.time_stride, self.time_stride)
            };
            let mut pad = kernel / 4;
            let merge = freq && freqs <= self.kernel_size;
            if merge {
                kernel = freqs;
                pad = 0;
                chout_z = chout.max(chout_z);
                chout = chout_z;
            }

            let dconv = DConvOptions {
                depth: self.dconv_depth,
                compress: self.dconv_comp,
                init: self.dconv_init,
                lstm: index >= self.dconv_lstm,
                attn: index >= self.dconv_attn,
            };
            let encoder = LayerGeometry {
                branch: if freq { Branch::Freq } else { Branch::Time },
                chin: chin_z,
                chout: chout_z,
                kernel,
                stride,
                pad,
                norm_groups: (index >= self.norm_starts).then_some(self.norm_groups),
                rewrite: self.rewrite.then_some(self.context_enc),
                dconv: self.encoder_dconv().then_some(dconv),
                empty: false,
                last: false,
            };
            let tencoder = freq.then_some(LayerGeometry {
                branch: Branch::Time,
                chin,
                chout,
                kernel: self.kernel_size,
                stride: self.stride,
                pad: self.kernel_size / 4,
                empty: merge,
                ..encoder
            });

            if index == 0 {
                chin = self.audio_channels * self.num_sources();
                chin_z = 2 * chin;
            }

            let decoder = LayerGeometry {
                chin: chout_z,
                chout: chin_z,
                rewrite: self.rewrite.then_some(self.context),
                dconv: self.decoder_dconv().then_some(dconv),
                last: index == 0,
                ..encoder
            };
            let tdecoder = freq.then_some(LayerGeometry {
                branch: Branch::Time,
                chin: chout,
                chout: chin,
                kernel: self.kernel_size,
                stride: self.stride,
                pad: self.kernel_size / 4,
                empty: merge,
                ..decoder
            });

            levels.push(HybridLevel {
                index,
                freqs,
                encoder,
                decoder,
                tencoder,
                tdecoder,
            });

            chin = chout;
            chin_z = chout_z;
            chout *= self.growth;
            chout_z *= self.growth;
            if freq {
                freqs = if freqs <= self.kernel_size { 1 } else { freqs / self.stride };
            }
        }
        levels
    }

    /// Reject architectures the native implementation cannot run
    pub fn validate(&self) -> MlResult<()> {
        let fail = |msg: String| Err(MlError::InvalidConfig(msg));

        if self.sources.is_empty() {
            return fail("at least one source is required".into());
        }
        if !self.cac {
            return fail("only complex-as-channels spectrogram input is supported".into());
        }
        if self.audio_channels == 0 || self.channels == 0 || self.growth == 0 || self.depth == 0 {
            return fail("channels, growth, depth and audio_channels must be non-zero".into());
        }
        if self.nfft < 16 || !self.nfft.is_power_of_two() {
            return fail(format!("nfft must be a power of two, got {}", self.nfft));
        }
        if self.stride < 2 || self.kernel_size < self.stride || self.time_stride == 0 {
            return fail(format!(
                "kernel_size {} / stride {} / time_stride {} not supported",
                self.kernel_size, self.stride, self.time_stride
            ));
        }

        let levels = self.levels();
        let Some(merge) = levels.iter().position(HybridLevel::is_merge) else {
            return fail(format!(
                "{} levels never merge {} frequency bins into the waveform branch",
                self.depth,
                self.nfft / 2
            ));
        };
        for level in &levels[..merge] {
            if level.freqs % self.stride != 0 {
                return fail(format!(
                    "encoder {} sees {} frequency bins, not divisible by stride {}",
                    level.index, level.freqs, self.stride
                ));
            }
        }
        // the merged waveform must line up with the spectrogram frames
        if self.stride.pow(merge as u32 + 1) != self.hop_length() {
            return fail(format!(
                "{} waveform levels of stride {} do not match the hop length {}",
                merge + 1,
                self.stride,
                self.hop_length()
            ));
        }

        for level in &levels {
            let encoders = std::iter::once(&level.encoder).chain(level.tencoder.as_ref());
            let decoders = std::iter::once(&level.decoder).chain(level.tdecoder.as_ref());
            for (geometry, checked) in encoders
                .map(|g| (g, g.chout))
                .chain(decoders.map(|g| (g, g.chin)))
            {
                if let Some(groups) = geometry.norm_groups {
                    if groups == 0 || geometry.chout % groups != 0 || checked % groups != 0 {
                        return fail(format!(
                            "norm_groups {groups} does not divide the channels of level {}",
                            level.index
                        ));
                    }
                }
                if geometry.empty {
                    continue;
                }
                if let Some(dconv) = &geometry.dconv {
                    dconv
                        .check(checked)
                        .map_err(|msg| MlError::InvalidConfig(format!("level {}: {msg}", level.index)))?;
                }
            }
        }

        let length = self.training_length();
        if length < self.nfft {
            return fail(format!("segment of {length} samples is shorter than nfft"));
        }
        Ok(())
    }

    /// Every parameter the architecture expects, with PyTorch state-dict names
    pub fn parameter_specs(&self) -> Vec<ParamSpec> {
        let levels = self.levels();
        let waveform_levels = levels.iter().filter(|l| l.tencoder.is_some()).count();
        let mut specs = Vec::new();

        for level in &levels {
            let i = level.index;
            level.encoder.push_encoder_specs(&mut specs, &format!("encoder.{i}"));
            if let Some(tencoder) = &level.tencoder {
                tencoder.push_encoder_specs(&mut specs, &format!("tencoder.{i}"));
            }
        }
        for level in levels.iter().rev() {
            let slot = self.depth - 1 - level.index;
            level.decoder.push_decoder_specs(&mut specs, &format!("decoder.{slot}"));
            if let Some(tdecoder) = &level.tdecoder {
                let slot = waveform_levels - 1 - level.index;
                tdecoder.push_decoder_specs(&mut specs, &format!("tdecoder.{slot}"));
            }
        }

        if self.freq_emb > 0.0 {
            specs.push(ParamSpec::new(
                "freq_emb.embedding.weight",
                &[self.freq_emb_rows(), self.channels],
                ParamInit::Uniform(0.1),
            ));
        }
        specs
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_specs().iter().map(ParamSpec::numel).sum()
    }

    /// Deterministic random weights matching this architecture
    pub fn random_weights(&self, seed: u64) -> WeightStore {
        WeightStore::random(&self.parameter_specs(), seed)
    }

    /// Recover the architecture from tensor shapes, `base` fills in the rest
    pub fn infer(store: &WeightStore, base: &HDemucsConfig) -> MlResult<Self> {
        let mut cfg = base.clone();
        let shape = |name: &str| store.shape(name).map(<[usize]>::to_vec);
        let count = |pattern: &dyn Fn(usize) -> String| (0..).take_while(|i| store.contains(&pattern(*i))).count();

        let first = shape("encoder.0.conv.weight").ok_or_else(|| MlError::MissingTensor {
            name: "encoder.0.conv.weight".into(),
        })?;
        if first.len() != 4 {
            return Err(MlError::ModelLoadFailed {
                reason: format!("encoder.0.conv.weight has rank {}, expected 4", first.len()),
            });
        }

        cfg.depth = count(&|i| format!("encoder.{i}.conv.weight"));
        cfg.channels = first[0];
        cfg.audio_channels = first[1] / 2;
        cfg.kernel_size = first[2];
        cfg.stride = cfg.kernel_size / 2;
        if let Some(second) = shape("encoder.1.conv.weight") {
            cfg.growth = (second[0] / cfg.channels.max(1)).max(1);
        }

        // the merge level's kernel spans all remaining rows
        let waveform_levels = count(&|i| format!("tencoder.{i}.conv.weight"));
        if waveform_levels == 0 || waveform_levels >= cfg.depth {
            return Err(MlError::ModelLoadFailed {
                reason: format!("{waveform_levels} waveform encoders for {} levels", cfg.depth),
            });
        }
        let merge = waveform_levels - 1;
        if let Some(merged) = shape(&format!("encoder.{merge}.conv.weight")) {
            cfg.nfft = 2 * merged[2] * cfg.stride.pow(merge as u32);
        }
        if let Some(time) = shape(&format!("encoder.{waveform_levels}.conv.weight")) {
            cfg.time_stride = (time[2] / 2).max(1);
        }

        let last_dec = format!("decoder.{}.conv_tr.weight", cfg.depth - 1);
        let out = shape(&last_dec).ok_or_else(|| MlError::MissingTensor { name: last_dec.clone() })?;
        let num_sources = out[1] / (cfg.audio_channels * 2).max(1);
        if num_sources != cfg.sources.len() {
            cfg.sources = StemType::for_source_count(num_sources)?;
        }

        let enc_dconv = store.contains("encoder.0.dconv.layers.0.0.weight");
        let dec_dconv = store.contains(&format!("decoder.{}.dconv.layers.0.0.weight", cfg.depth - 1));
        cfg.dconv_mode = u8::from(enc_dconv) | (u8::from(dec_dconv) << 1);
        if enc_dconv {
            cfg.dconv_depth = count(&|d| format!("encoder.0.dconv.layers.{d}.0.weight"));
            if let Some(hidden) = shape("encoder.0.dconv.layers.0.0.weight") {
                cfg.dconv_comp = (hidden[1] / hidden[0].max(1)).max(1);
            }
            cfg.dconv_lstm = (0..cfg.depth)
                .find(|i| store.contains(&format!("encoder.{i}.dconv.layers.0.3.lstm.weight_ih_l0")))
                .unwrap_or(cfg.dconv_lstm.max(cfg.depth));
            cfg.dconv_attn = (0..cfg.depth)
                .find(|i| {
                    (3..5).any(|at| store.contains(&format!("encoder.{i}.dconv.layers.0.{at}.query_decay.weight")))
                })
                .unwrap_or(cfg.dconv_attn.max(cfg.depth));
        }

        match shape("encoder.0.rewrite.weight") {
            Some(rw) => {
                cfg.rewrite = true;
                cfg.context_enc = rw[2] / 2;
            }
            None => cfg.rewrite = false,
        }
        if let Some(rw) = shape("decoder.0.rewrite.weight") {
            cfg.context = rw[2] / 2;
        }

        cfg.norm_starts = (0..cfg.depth)
            .find(|i| store.contains(&format!("encoder.{i}.norm1.weight")))
            .unwrap_or(cfg.norm_starts.max(cfg.depth));

        if store.contains("freq_emb.embedding.weight") {
            if cfg.freq_emb <= 0.0 {
                cfg.freq_emb = 0.2;
            }
        } else {
            cfg.freq_emb = 0.0;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_published_model() {
        let cfg = HDemucsConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.training_length(), 343_980);

        let levels = cfg.levels();
        let freqs: Vec<_> = levels.iter().map(|l| l.freqs).collect();
        assert_eq!(freqs, [2048, 512, 128, 32, 8, 1]);
        assert!(levels[4].is_merge());
        assert_eq!(levels[4].encoder.kernel, 8);
        assert_eq!(levels[4].encoder.pad, 0);
        assert_eq!(levels[5].encoder.branch, Branch::Time);
        assert_eq!((levels[5].encoder.kernel, levels[5].encoder.stride), (4, 2));
        assert!(levels[5].tencoder.is_none());
        assert!(levels[4].encoder.dconv.is_some_and(|d| d.lstm && d.attn));
        assert!(levels[3].encoder.dconv.is_some_and(|d| !d.lstm && !d.attn));
        assert!(levels[0].decoder.dconv.is_none());
    }

    #[test]
    fn test_default_parameter_names() {
        let specs = HDemucsConfig::default().parameter_specs();
        let find = |name: &str| specs.iter().find(|s| s.name == name).map(|s| s.shape.clone());

        assert_eq!(find("encoder.0.conv.weight"), Some(vec![48, 4, 8, 1]));
        assert_eq!(find("encoder.4.conv.weight"), Some(vec![768, 384, 8, 1]));
        assert_eq!(find("encoder.5.conv.weight"), Some(vec![1536, 768, 4]));
        assert_eq!(find("tencoder.4.conv.weight"), Some(vec![768, 384, 8]));
        assert!(find("tencoder.4.norm1.weight").is_none());
        assert!(find("tencoder.5.conv.weight").is_none());
        assert_eq!(
            find("encoder.4.dconv.layers.0.3.lstm.weight_ih_l0"),
            Some(vec![768, 192])
        );
        assert_eq!(find("encoder.5.dconv.layers.1.4.query_decay.weight"), Some(vec![16, 384, 1]));
        assert_eq!(find("encoder.5.dconv.layers.1.8.scale"), Some(vec![1536]));
        assert_eq!(find("decoder.0.conv_tr.weight"), Some(vec![1536, 768, 4]));
        assert_eq!(find("decoder.5.conv_tr.weight"), Some(vec![48, 16, 8, 1]));
        assert_eq!(find("tdecoder.0.conv_tr.weight"), Some(vec![768, 384, 8]));
        assert!(find("tdecoder.0.rewrite.weight").is_none());
        assert_eq!(find("tdecoder.4.conv_tr.weight"), Some(vec![48, 8, 8]));
        assert_eq!(find("freq_emb.embedding.weight"), Some(vec![512, 48]));
        assert!(find("decoder.1.dconv.layers.0.0.weight").is_none());

        let unique: std::collections::HashSet<_> = specs.iter().map(|s| &s.name).collect();
        assert_eq!(unique.len(), specs.len());
    }

    #[test]
    fn test_default_parameter_count_is_plausible() {
        // hdemucs_mmi is in the 80M range
        let count = HDemucsConfig::default().parameter_count();
        assert!(count > 60_000_000 && count < 110_000_000, "{count}");
    }

    #[test]
    fn test_tiny_is_valid() {
        let cfg = HDemucsConfig::tiny();
        assert!(cfg.validate().is_ok());
        let levels = cfg.levels();
        assert!(levels[2].is_merge());
        assert_eq!(levels[3].encoder.branch, Branch::Time);
    }

    #[test]
    fn test_validate_rejects_unmerged_branches() {
        let cfg = HDemucsConfig {
            depth: 3,
            ..HDemucsConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = HDemucsConfig {
            dconv_comp: 5,
            ..HDemucsConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = HDemucsConfig {
            segment: 0.01,
            ..HDemucsConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    fn rejection(cfg: HDemucsConfig) -> String {
        match cfg.validate() {
            Err(MlError::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_misaligned_levels() {
        // 1024 bins merge after 5 levels, but 4^5 samples is two hops of 512
        let msg = rejection(HDemucsConfig {
            nfft: 2048,
            ..HDemucsConfig::default()
        });
        assert!(msg.contains("hop length 512"), "{msg}");

        // 2048 bins are not divisible by a stride of 3
        let msg = rejection(HDemucsConfig {
            stride: 3,
            time_stride: 3,
            ..HDemucsConfig::default()
        });
        assert!(msg.contains("not divisible by stride 3"), "{msg}");

        // 768 channels at level 4 do not split into 5 groups
        let msg = rejection(HDemucsConfig {
            norm_groups: 5,
            ..HDemucsConfig::default()
        });
        assert!(msg.contains("norm_groups 5"), "{msg}");
    }

    #[test]
    fn test_infer_round_trip() {
        let original = HDemucsConfig {
            sources: StemType::vocals_2(),
            ..HDemucsConfig::tiny()
        };
        let store = original.random_weights(1);
        let inferred = HDemucsConfig::infer(&store, &HDemucsConfig::tiny()).unwrap();
        assert_eq!(inferred, original);
    }

    #[test]
    fn test_infer_without_sequence_layers() {
        let original = HDemucsConfig {
            dconv_lstm: 4,
            dconv_attn: 3,
            ..HDemucsConfig::tiny()
        };
        let store = original.random_weights(2);
        let inferred = HDemucsConfig::infer(&store, &HDemucsConfig::tiny()).unwrap();
        assert_eq!(inferred.dconv_attn, 3);
        assert_eq!(inferred.dconv_lstm, 4);
        assert_eq!(inferred, original);
    }

    #[test]
    fn test_sidecar_json_defaults() {
        let cfg: HDemucsConfig = serde_json::from_str(r#"{"segment": 10.0}"#).unwrap();
        assert_eq!(cfg.segment, 10.0);
        assert_eq!(cfg.depth, 6);
        assert_eq!(cfg.dconv_lstm, 4);
    }
}
