//! Hybrid Demucs (v3) network
//!
//! ```text
//!   mix ──► STFT ──► CaC ──► norm ──► encoder 0..M ──(+)──► encoder M+1..D ──► decoder D..M ─┬─► decoder M-1..0 ──► denorm ──► ISTFT ──┐
//!    │                                                 ▲                                      │                                        (+)──► [S, C, L]
//!    └──────────────────────► norm ──► tencoder 0..M ──┘                                      └─► tdecoder M..0 ──► denorm ────────────┘
//! ```

use std::time::Instant;

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::error::{MlError, MlResult};
use crate::htdemucs::layers::{HDecLayer, HEncLayer};
use crate::htdemucs::model::{add_freq_embedding, pop, HybridInputs};
use crate::htdemucs::Spectrogram;
use crate::separation::{SeparationModel, StemType};
use crate::weights::WeightStore;

use super::config::HDemucsConfig;

/// Native Hybrid Demucs network loaded from a weight store
#[derive(Debug)]
pub struct HDemucs {
    name: String,
    config: HDemucsConfig,
    spectrogram: Spectrogram,
    encoders: Vec<HEncLayer>,
    /// One per level above and including the merge
    tencoders: Vec<HEncLayer>,
    /// Innermost first
    decoders: Vec<HDecLayer>,
    tdecoders: Vec<HDecLayer>,
    freq_emb: Option<Array2<f32>>,
    parameter_count: usize,
}

impl HDemucs {
    pub fn load(store: &WeightStore, config: HDemucsConfig, name: impl Into<String>) -> MlResult<Self> {
        config.validate()?;
        let specs = config.parameter_specs();
        store.validate(&specs)?;

        let unused = store.unused(&specs);
        if !unused.is_empty() {
            log::warn!(
                "{} tensors in the weight file are not used by the model (first: {})",
                unused.len(),
                unused[0]
            );
        }

        let name = name.into();
        let start = Instant::now();
        let levels = config.levels();
        let depth = levels.len();
        let waveform_levels = levels.iter().filter(|l| l.tencoder.is_some()).count();

        let mut encoders = Vec::with_capacity(depth);
        let mut tencoders = Vec::with_capacity(waveform_levels);
        for level in &levels {
            let i = level.index;
            encoders.push(HEncLayer::load(store, &format!("encoder.{i}"), &level.encoder)?);
            if let Some(geometry) = &level.tencoder {
                tencoders.push(HEncLayer::load(store, &format!("tencoder.{i}"), geometry)?);
            }
        }

        let mut decoders = Vec::with_capacity(depth);
        let mut tdecoders = Vec::with_capacity(waveform_levels);
        for level in levels.iter().rev() {
            let slot = depth - 1 - level.index;
            decoders.push(HDecLayer::load(store, &format!("decoder.{slot}"), &level.decoder)?);
            if let Some(geometry) = &level.tdecoder {
                let slot = waveform_levels - 1 - level.index;
                tdecoders.push(HDecLayer::load(store, &format!("tdecoder.{slot}"), geometry)?);
            }
        }

        let freq_emb = if config.freq_emb > 0.0 {
            let mut emb = store.array2("freq_emb.embedding.weight", [config.freq_emb_rows(), config.channels])?;
            emb *= config.freq_emb * config.emb_scale;
            Some(emb)
        } else {
            None
        };

        let parameter_count = specs.iter().map(|s| s.numel()).sum();
        log::info!(
            "Loaded HDemucs '{}' ({} sources, {:.1}M parameters) in {:?}",
            name,
            config.num_sources(),
            parameter_count as f64 / 1e6,
            start.elapsed()
        );

        Ok(Self {
            name,
            spectrogram: Spectrogram::new(config.nfft)?,
            config,
            encoders,
            tencoders,
            decoders,
            tdecoders,
            freq_emb,
            parameter_count,
        })
    }

    pub fn config(&self) -> &HDemucsConfig {
        &self.config
    }

    /// Separate one segment: `[C, L]` with `L <= training_length` into `[S, C, L]`
    pub fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
        let cfg = &self.config;
        let HybridInputs { mut x, mut xt, stats } =
            HybridInputs::prepare(&self.spectrogram, mix, cfg.audio_channels, cfg.training_length())?;

        let depth = self.encoders.len();
        let mut saved = Vec::with_capacity(depth);
        let mut saved_t = Vec::with_capacity(self.tencoders.len());
        let mut lengths = Vec::with_capacity(depth);
        let mut lengths_t = Vec::with_capacity(self.tencoders.len());

        for (idx, encode) in self.encoders.iter().enumerate() {
            lengths.push(x.len_of(Axis(2)));
            let mut inject = None;
            if let Some(tencode) = self.tencoders.get(idx) {
                lengths_t.push(xt.len_of(Axis(2)));
                xt = tencode.forward(xt.view())?;
                if tencode.is_empty() {
                    inject = Some(xt.clone());
                } else {
                    saved_t.push(xt.clone());
                }
            }

            x = encode.forward_injected(x.view(), inject.as_ref().map(|a| a.view()))?;
            if idx == 0 {
                if let Some(emb) = &self.freq_emb {
                    add_freq_embedding(&mut x, emb)?;
                }
            }
            saved.push(x.clone());
        }

        let mut x = Array3::<f32>::zeros(x.raw_dim());
        let mut xt = Array3::<f32>::zeros((0, 1, 0));
        let offset = depth - self.tdecoders.len();

        for (idx, decode) in self.decoders.iter().enumerate() {
            let skip = pop(&mut saved)?;
            let (z, pre) = decode.forward_with_pre(x, &skip, pop(&mut lengths)?)?;
            x = z;

            if idx < offset {
                continue;
            }
            let tdecode = &self.tdecoders[idx - offset];
            let length_t = pop(&mut lengths_t)?;
            xt = if tdecode.is_empty() {
                if pre.len_of(Axis(1)) != 1 {
                    return Err(MlError::InferenceFailed {
                        reason: format!("merged level still has {} rows", pre.len_of(Axis(1))),
                    });
                }
                tdecode.forward_empty(pre.view(), length_t)?
            } else {
                let skip_t = pop(&mut saved_t)?;
                tdecode.forward(xt, &skip_t, length_t)?
            };
        }

        stats.combine(&self.spectrogram, x, &xt, cfg.num_sources())
    }
}

impl SeparationModel for HDemucs {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[StemType] {
        &self.config.sources
    }

    fn samplerate(&self) -> u32 {
        self.config.samplerate
    }

    fn audio_channels(&self) -> usize {
        self.config.audio_channels
    }

    fn segment_length(&self) -> usize {
        self.config.training_length()
    }

    fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
        HDemucs::forward(self, mix)
    }

    fn parameter_count(&self) -> usize {
        self.parameter_count
    }
}
