//! Hybrid Transformer Demucs (v4)
//!
//! ```text
//!   mix ──► STFT ──► CaC ──► norm ──► encoder 0..D ─┐            ┌─► decoder D..0 ──► denorm ──► ISTFT ──┐
//!    │                                  (+freq emb)  ├─► cross  ──┤                                       (+)──► [S, C, L]
//!    └──────────────────────► norm ──► tencoder 0..D ┘  transformer └─► tdecoder D..0 ──► denorm ───────────┘
//! ```

use std::time::Instant;

use ndarray::{s, Array2, Array3, ArrayView2, Axis};

use crate::error::{MlError, MlResult};
use crate::nn::Conv2d;
use crate::separation::{SeparationModel, StemType};
use crate::weights::WeightStore;

use super::config::HTDemucsConfig;
use super::layers::{Branch, HDecLayer, HEncLayer};
use super::spec::{channels_as_complex, complex_as_channels, Spectrogram};
use super::transformer::CrossTransformerEncoder;

/// Normalisation epsilon added to the standard deviation
const STD_EPS: f32 = 1e-5;

/// 1x1 projections between the encoder width and the transformer width
#[derive(Debug, Clone)]
struct ChannelSamplers {
    up: Conv2d,
    down: Conv2d,
    up_t: Conv2d,
    down_t: Conv2d,
}

impl ChannelSamplers {
    fn load(store: &WeightStore, cfg: &HTDemucsConfig) -> MlResult<Self> {
        let chz = cfg.bottleneck_channels();
        let dim = cfg.bottom_channels;
        Ok(Self {
            up: Conv2d::load_1d(store, "channel_upsampler", [dim, chz, 1])?,
            down: Conv2d::load_1d(store, "channel_downsampler", [chz, dim, 1])?,
            up_t: Conv2d::load_1d(store, "channel_upsampler_t", [dim, chz, 1])?,
            down_t: Conv2d::load_1d(store, "channel_downsampler_t", [chz, dim, 1])?,
        })
    }
}

/// Native HTDemucs network loaded from a weight store
#[derive(Debug)]
pub struct HTDemucs {
    name: String,
    config: HTDemucsConfig,
    spectrogram: Spectrogram,
    encoders: Vec<HEncLayer>,
    tencoders: Vec<HEncLayer>,
    /// Innermost first
    decoders: Vec<HDecLayer>,
    tdecoders: Vec<HDecLayer>,
    /// `[Fr / stride, channels]`, pre-multiplied by `freq_emb * emb_scale`
    freq_emb: Option<Array2<f32>>,
    samplers: Option<ChannelSamplers>,
    transformer: Option<CrossTransformerEncoder>,
    parameter_count: usize,
}

impl HTDemucs {
    /// Build the network, requiring every expected tensor with its exact shape
    pub fn load(store: &WeightStore, config: HTDemucsConfig, name: impl Into<String>) -> MlResult<Self> {
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

        let encoders = (0..config.depth)
            .map(|i| HEncLayer::load(store, &format!("encoder.{i}"), &config.encoder_geometry(Branch::Freq, i)))
            .collect::<MlResult<Vec<_>>>()?;
        let tencoders = (0..config.depth)
            .map(|i| HEncLayer::load(store, &format!("tencoder.{i}"), &config.encoder_geometry(Branch::Time, i)))
            .collect::<MlResult<Vec<_>>>()?;
        let decoders = (0..config.depth)
            .rev()
            .map(|i| {
                let slot = config.depth - 1 - i;
                HDecLayer::load(store, &format!("decoder.{slot}"), &config.decoder_geometry(Branch::Freq, i))
            })
            .collect::<MlResult<Vec<_>>>()?;
        let tdecoders = (0..config.depth)
            .rev()
            .map(|i| {
                let slot = config.depth - 1 - i;
                HDecLayer::load(store, &format!("tdecoder.{slot}"), &config.decoder_geometry(Branch::Time, i))
            })
            .collect::<MlResult<Vec<_>>>()?;

        let freq_emb = if config.freq_emb > 0.0 {
            let rows = config.freq_bins(1);
            let mut emb = store.array2("freq_emb.embedding.weight", [rows, config.level(0).freq_out])?;
            emb *= config.freq_emb * config.emb_scale;
            Some(emb)
        } else {
            None
        };

        let (samplers, transformer) = if config.t_layers > 0 {
            let samplers = (config.bottom_channels > 0)
                .then(|| ChannelSamplers::load(store, &config))
                .transpose()?;
            (samplers, Some(CrossTransformerEncoder::load(store, &config)?))
        } else {
            (None, None)
        };

        let parameter_count = specs.iter().map(|s| s.numel()).sum();
        log::info!(
            "Loaded HTDemucs '{}' ({} sources, {:.1}M parameters) in {:?}",
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
            samplers,
            transformer,
            parameter_count,
        })
    }

    pub fn config(&self) -> &HTDemucsConfig {
        &self.config
    }

    /// Separate one segment: `[C, L]` with `L <= training_length` into `[S, C, L]`
    pub fn forward(&self, mix: ArrayView2<f32>) -> MlResult<Array3<f32>> {
        let cfg = &self.config;
        let HybridInputs { mut x, mut xt, stats } =
            HybridInputs::prepare(&self.spectrogram, mix, cfg.audio_channels, cfg.training_length())?;

        let mut saved = Vec::with_capacity(cfg.depth);
        let mut saved_t = Vec::with_capacity(cfg.depth);
        let mut lengths_t = Vec::with_capacity(cfg.depth);

        for (idx, (encode, tencode)) in self.encoders.iter().zip(&self.tencoders).enumerate() {
            lengths_t.push(xt.len_of(Axis(2)));
            xt = tencode.forward(xt.view())?;
            saved_t.push(xt.clone());

            x = encode.forward(x.view())?;
            if idx == 0 {
                if let Some(emb) = &self.freq_emb {
                    add_freq_embedding(&mut x, emb)?;
                }
            }
            saved.push(x.clone());
        }

        if let Some(transformer) = &self.transformer {
            if let Some(samplers) = &self.samplers {
                x = samplers.up.forward(x.view())?;
                xt = samplers.up_t.forward(xt.view())?;
            }
            (x, xt) = transformer.forward(x, xt)?;
            if let Some(samplers) = &self.samplers {
                x = samplers.down.forward(x.view())?;
                xt = samplers.down_t.forward(xt.view())?;
            }
        }

        for (decode, tdecode) in self.decoders.iter().zip(&self.tdecoders) {
            let skip = pop(&mut saved)?;
            x = decode.forward(x, &skip, 0)?;
            let skip_t = pop(&mut saved_t)?;
            let length_t = pop(&mut lengths_t)?;
            xt = tdecode.forward(xt, &skip_t, length_t)?;
        }

        stats.combine(&self.spectrogram, x, &xt, cfg.num_sources())
    }
}

impl SeparationModel for HTDemucs {
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
        HTDemucs::forward(self, mix)
    }

    fn parameter_count(&self) -> usize {
        self.parameter_count
    }
}

/// Normalised network inputs of both branches
pub(crate) struct HybridInputs {
    /// `[2C, Fr, T]` complex-as-channels spectrogram
    pub x: Array3<f32>,
    /// `[C, 1, training_length]` waveform
    pub xt: Array3<f32>,
    pub stats: BranchStats,
}

/// What it takes to undo the input normalisation
pub(crate) struct BranchStats {
    channels: usize,
    length: usize,
    training_length: usize,
    mean: f32,
    std: f32,
    meant: f32,
    stdt: f32,
}

impl HybridInputs {
    /// Zero-pad the mix to the training length, then normalise each branch
    pub fn prepare(
        spectrogram: &Spectrogram,
        mix: ArrayView2<f32>,
        audio_channels: usize,
        training_length: usize,
    ) -> MlResult<Self> {
        let (channels, length) = mix.dim();
        if channels != audio_channels {
            return Err(MlError::ChannelMismatch {
                expected: audio_channels,
                got: channels,
            });
        }
        if length == 0 || length > training_length {
            return Err(MlError::InvalidInputShape {
                expected: format!("1..={training_length} samples"),
                got: length.to_string(),
            });
        }

        let mut padded = Array2::<f32>::zeros((channels, training_length));
        padded.slice_mut(s![.., ..length]).assign(&mix);

        // spectral branch input
        let z = spectrogram.spec(padded.view())?;
        let mut x = complex_as_channels(&z);
        let (mean, std) = mean_std(x.iter().copied());
        x.mapv_inplace(|v| (v - mean) / (STD_EPS + std));

        // waveform branch input, [C, 1, L]
        let (meant, stdt) = mean_std(padded.iter().copied());
        let mut xt = padded.insert_axis(Axis(1));
        xt.mapv_inplace(|v| (v - meant) / (STD_EPS + stdt));

        Ok(Self {
            x,
            xt,
            stats: BranchStats {
                channels,
                length,
                training_length,
                mean,
                std,
                meant,
                stdt,
            },
        })
    }
}

impl BranchStats {
    /// Denormalise both decoder outputs and sum them per source into `[S, C, L]`
    pub fn combine(
        &self,
        spectrogram: &Spectrogram,
        mut x: Array3<f32>,
        xt: &Array3<f32>,
        sources: usize,
    ) -> MlResult<Array3<f32>> {
        let (channels, length) = (self.channels, self.length);
        let (_, bins, frames) = x.dim();
        if x.len_of(Axis(0)) != sources * channels * 2 || xt.len_of(Axis(0)) != sources * channels {
            return Err(MlError::InvalidOutputShape {
                expected: format!("{} spectral and {} waveform channels", sources * channels * 2, sources * channels),
                got: format!("{} and {}", x.len_of(Axis(0)), xt.len_of(Axis(0))),
            });
        }

        // [S * C * 2, Fr, T] -> per-source complex spectrogram -> waveform
        let (std, mean) = (self.std, self.mean);
        x.mapv_inplace(|v| v * std + mean);
        let per_source = channels * 2;
        let mut out = Array3::<f32>::zeros((sources, channels, length));
        for s_idx in 0..sources {
            let block = x.slice(s![s_idx * per_source..(s_idx + 1) * per_source, .., ..]);
            let zout = channels_as_complex(block)?;
            debug_assert_eq!(zout.dim(), (channels, bins, frames));
            let wave = spectrogram.ispec(zout.view(), self.training_length)?;

            let mut target = out.index_axis_mut(Axis(0), s_idx);
            for c in 0..channels {
                let time = xt.slice(s![s_idx * channels + c, 0, ..length]);
                let freq = wave.slice(s![c, ..length]);
                let mut row = target.index_axis_mut(Axis(0), c);
                ndarray::Zip::from(&mut row)
                    .and(&freq)
                    .and(&time)
                    .for_each(|o, &f, &t| *o = f + t * self.stdt + self.meant);
            }
        }

        Ok(out)
    }
}

/// Mean and unbiased standard deviation
fn mean_std(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let (n, sum) = values.clone().fold((0usize, 0.0f64), |(n, s), v| (n + 1, s + v as f64));
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let ss: f64 = values.map(|v| (v as f64 - mean).powi(2)).sum();
    let std = if n > 1 { (ss / (n - 1) as f64).sqrt() } else { 0.0 };
    (mean as f32, std as f32)
}

/// `x[c, f, t] += emb[f, c]`
pub(crate) fn add_freq_embedding(x: &mut Array3<f32>, emb: &Array2<f32>) -> MlResult<()> {
    let (channels, freqs, _) = x.dim();
    if emb.dim() != (freqs, channels) {
        return Err(MlError::ShapeMismatch {
            name: "freq_emb.embedding.weight".into(),
            expected: vec![freqs, channels],
            got: emb.shape().to_vec(),
        });
    }
    for ((c, f, _), v) in x.indexed_iter_mut() {
        *v += emb[[f, c]];
    }
    Ok(())
}

pub(crate) fn pop<T>(stack: &mut Vec<T>) -> MlResult<T> {
    stack.pop().ok_or_else(|| MlError::InferenceFailed {
        reason: "encoder/decoder depth mismatch".into(),
    })
}
