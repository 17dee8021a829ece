//! HTDemucs architecture hyper-parameters
//!
//! Field names follow the training configuration of the released
//! checkpoints so a JSON sidecar exported next to the weights can be read
//! directly. Anything missing from the sidecar falls back to the published
//! `htdemucs` values.

use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};
use crate::separation::StemType;
use crate::weights::{push_conv, push_linear, push_norm, ParamInit, ParamSpec, WeightStore};

use super::layers::{Branch, DConvOptions, LayerGeometry};

/// Hybrid Transformer Demucs configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HTDemucsConfig {
    /// Output sources, in model order
    pub sources: Vec<StemType>,
    pub audio_channels: usize,
    pub samplerate: u32,
    /// Training segment in seconds; inference windows have this length
    pub segment: f32,

    /// Channels of the first encoder layer
    pub channels: usize,
    /// Channel multiplier per layer
    pub growth: usize,
    pub nfft: usize,
    /// Complex-as-channels spectrogram input (only mode supported)
    pub cac: bool,
    pub depth: usize,
    pub kernel_size: usize,
    pub stride: usize,
    /// Decoder rewrite context (kernel `1 + 2 * context`)
    pub context: usize,
    /// Encoder rewrite context
    pub context_enc: usize,
    pub rewrite: bool,

    /// Frequency embedding weight, 0 disables it
    pub freq_emb: f32,
    pub emb_scale: f32,

    /// First layer index using GroupNorm after convolutions
    pub norm_starts: usize,
    pub norm_groups: usize,

    /// Residual branch placement: bit 0 encoder, bit 1 decoder
    pub dconv_mode: u8,
    pub dconv_depth: usize,
    pub dconv_comp: usize,
    pub dconv_init: f32,

    /// Transformer width when non-zero (1x1 up/down samplers around it)
    pub bottom_channels: usize,
    pub t_layers: usize,
    pub t_heads: usize,
    pub t_hidden_scale: f32,
    pub t_cross_first: bool,
    pub t_max_period: f32,
    pub t_weight_pos_embed: f32,
    pub t_norm_in: bool,
    pub t_norm_out: bool,
    pub t_layer_scale: bool,
}

impl Default for HTDemucsConfig {
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
            depth: 4,
            kernel_size: 8,
            stride: 4,
            context: 1,
            context_enc: 0,
            rewrite: true,
            freq_emb: 0.2,
            emb_scale: 10.0,
            norm_starts: 4,
            norm_groups: 4,
            dconv_mode: 3,
            dconv_depth: 2,
            dconv_comp: 8,
            dconv_init: 1e-3,
            bottom_channels: 512,
            t_layers: 5,
            t_heads: 8,
            t_hidden_scale: 4.0,
            t_cross_first: false,
            t_max_period: 10000.0,
            t_weight_pos_embed: 1.0,
            t_norm_in: true,
            t_norm_out: true,
            t_layer_scale: true,
        }
    }
}

/// Channel plan of one encoder level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChannels {
    /// Spectral branch encoder input / output
    pub freq_in: usize,
    pub freq_out: usize,
    /// Waveform branch encoder input / output
    pub time_in: usize,
    pub time_out: usize,
    /// Decoder outputs (differ from the encoder inputs at level 0)
    pub freq_dec_out: usize,
    pub time_dec_out: usize,
}

impl HTDemucsConfig {
    /// Small architecture used by tests and benchmarks
    pub fn tiny() -> Self {
        Self {
            samplerate: 8000,
            segment: 0.5,
            channels: 4,
            nfft: 512,
            depth: 2,
            dconv_comp: 2,
            bottom_channels: 0,
            t_layers: 2,
            t_heads: 2,
            t_hidden_scale: 2.0,
            ..Self::default()
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn hop_length(&self) -> usize {
        self.nfft / 4
    }

    /// Samples per model evaluation
    pub fn training_length(&self) -> usize {
        (self.segment as f64 * self.samplerate as f64) as usize
    }

    pub fn encoder_padding(&self) -> usize {
        self.kernel_size / 4
    }

    /// Channel plan for level `index` (0 = outermost)
    pub fn level(&self, index: usize) -> LevelChannels {
        let grow = self.growth.pow(index as u32);
        let freq_out = self.channels * grow;
        let time_out = self.channels * grow;
        let (freq_in, time_in) = if index == 0 {
            (self.audio_channels * 2, self.audio_channels)
        } else {
            (freq_out / self.growth, time_out / self.growth)
        };
        let (freq_dec_out, time_dec_out) = if index == 0 {
            (
                self.num_sources() * self.audio_channels * 2,
                self.num_sources() * self.audio_channels,
            )
        } else {
            (freq_in, time_in)
        };
        LevelChannels {
            freq_in,
            freq_out,
            time_in,
            time_out,
            freq_dec_out,
            time_dec_out,
        }
    }

    /// Channels entering the transformer from the last encoder
    pub fn bottleneck_channels(&self) -> usize {
        self.level(self.depth - 1).freq_out
    }

    /// Transformer model width
    pub fn transformer_dim(&self) -> usize {
        if self.bottom_channels > 0 {
            self.bottom_channels
        } else {
            self.bottleneck_channels()
        }
    }

    pub fn transformer_hidden(&self) -> usize {
        (self.transformer_dim() as f32 * self.t_hidden_scale) as usize
    }

    /// Frequency bins entering encoder `index`
    pub fn freq_bins(&self, index: usize) -> usize {
        (self.nfft / 2) / self.stride.pow(index as u32)
    }

    pub fn norm_at(&self, index: usize) -> bool {
        index >= self.norm_starts
    }

    pub fn encoder_dconv(&self) -> bool {
        self.dconv_mode & 1 != 0
    }

    pub fn decoder_dconv(&self) -> bool {
        self.dconv_mode & 2 != 0
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
        if self.stride == 0 || self.kernel_size < self.stride || self.kernel_size % 4 != 0 {
            return fail(format!(
                "kernel_size {} / stride {} not supported",
                self.kernel_size, self.stride
            ));
        }
        if self.kernel_size != 2 * self.stride {
            return fail("kernel_size must be twice the stride".into());
        }
        for index in 0..self.depth {
            let bins = self.freq_bins(index);
            if bins <= self.kernel_size || bins % self.stride != 0 {
                return fail(format!(
                    "encoder {index} would see {bins} frequency bins; \
                     layers merging the spectral branch into time are not supported"
                ));
            }
        }
        if self.encoder_dconv() || self.decoder_dconv() {
            self.dconv_options().check(self.channels).map_err(MlError::InvalidConfig)?;
        }
        if self.norm_starts < self.depth {
            for index in self.norm_starts..self.depth {
                let level = self.level(index);
                if self.norm_groups == 0 || level.freq_out % self.norm_groups != 0 {
                    return fail(format!("norm_groups {} does not divide {}", self.norm_groups, level.freq_out));
                }
            }
        }
        if self.t_layers > 0 {
            let dim = self.transformer_dim();
            if self.t_heads == 0 || dim % self.t_heads != 0 {
                return fail(format!("transformer width {dim} not divisible by {} heads", self.t_heads));
            }
            if dim % 4 != 0 {
                return fail(format!("transformer width {dim} must be a multiple of 4"));
            }
        }
        let length = self.training_length();
        if length < self.nfft {
            return fail(format!("segment of {length} samples is shorter than nfft"));
        }
        Ok(())
    }

    /// Residual branch options (no BiLSTM or attention in v4)
    pub fn dconv_options(&self) -> DConvOptions {
        DConvOptions {
            depth: self.dconv_depth,
            compress: self.dconv_comp,
            init: self.dconv_init,
            lstm: false,
            attn: false,
        }
    }

    pub fn encoder_geometry(&self, branch: Branch, index: usize) -> LayerGeometry {
        let ch = self.level(index);
        let (chin, chout) = match branch {
            Branch::Freq => (ch.freq_in, ch.freq_out),
            Branch::Time => (ch.time_in, ch.time_out),
        };
        LayerGeometry {
            branch,
            chin,
            chout,
            kernel: self.kernel_size,
            stride: self.stride,
            pad: self.encoder_padding(),
            norm_groups: self.norm_at(index).then_some(self.norm_groups),
            rewrite: self.rewrite.then_some(self.context_enc),
            dconv: self.encoder_dconv().then(|| self.dconv_options()),
            empty: false,
            last: false,
        }
    }

    pub fn decoder_geometry(&self, branch: Branch, index: usize) -> LayerGeometry {
        let ch = self.level(index);
        let (chin, chout) = match branch {
            Branch::Freq => (ch.freq_out, ch.freq_dec_out),
            Branch::Time => (ch.time_out, ch.time_dec_out),
        };
        LayerGeometry {
            branch,
            chin,
            chout,
            kernel: self.kernel_size,
            stride: self.stride,
            pad: self.encoder_padding(),
            norm_groups: self.norm_at(index).then_some(self.norm_groups),
            rewrite: self.rewrite.then_some(self.context),
            dconv: self.decoder_dconv().then(|| self.dconv_options()),
            empty: false,
            last: index == 0,
        }
    }

    /// Every parameter the architecture expects, with PyTorch state-dict names
    pub fn parameter_specs(&self) -> Vec<ParamSpec> {
        let mut specs = Vec::new();

        for index in 0..self.depth {
            self.encoder_geometry(Branch::Freq, index)
                .push_encoder_specs(&mut specs, &format!("encoder.{index}"));
            self.encoder_geometry(Branch::Time, index)
                .push_encoder_specs(&mut specs, &format!("tencoder.{index}"));
        }

        for index in (0..self.depth).rev() {
            let slot = self.depth - 1 - index;
            self.decoder_geometry(Branch::Freq, index)
                .push_decoder_specs(&mut specs, &format!("decoder.{slot}"));
            self.decoder_geometry(Branch::Time, index)
                .push_decoder_specs(&mut specs, &format!("tdecoder.{slot}"));
        }

        if self.freq_emb > 0.0 {
            let rows = self.freq_bins(1);
            let dim = self.level(0).freq_out;
            specs.push(ParamSpec::new(
                "freq_emb.embedding.weight",
                &[rows, dim],
                ParamInit::Uniform(0.1),
            ));
        }

        if self.t_layers > 0 {
            self.push_transformer(&mut specs);
        }

        specs
    }

    fn push_transformer(&self, specs: &mut Vec<ParamSpec>) {
        let dim = self.transformer_dim();
        let hidden = self.transformer_hidden();

        if self.bottom_channels > 0 {
            let chz = self.bottleneck_channels();
            push_conv(specs, "channel_upsampler", &[dim, chz, 1]);
            push_conv(specs, "channel_downsampler", &[chz, dim, 1]);
            push_conv(specs, "channel_upsampler_t", &[dim, chz, 1]);
            push_conv(specs, "channel_downsampler_t", &[chz, dim, 1]);
        }

        if self.t_norm_in {
            push_norm(specs, "crosstransformer.norm_in", dim);
            push_norm(specs, "crosstransformer.norm_in_t", dim);
        }

        for idx in 0..self.t_layers {
            for branch in ["layers", "layers_t"] {
                let p = format!("crosstransformer.{branch}.{idx}");
                let cross = self.is_cross_layer(idx);
                let attn = if cross { "cross_attn" } else { "self_attn" };

                let bound = 1.0 / (dim as f32).sqrt();
                specs.push(ParamSpec::new(
                    format!("{p}.{attn}.in_proj_weight"),
                    &[3 * dim, dim],
                    ParamInit::Uniform(bound),
                ));
                specs.push(ParamSpec::new(
                    format!("{p}.{attn}.in_proj_bias"),
                    &[3 * dim],
                    ParamInit::Zeros,
                ));
                push_linear(specs, &format!("{p}.{attn}.out_proj"), dim, dim);
                push_linear(specs, &format!("{p}.linear1"), dim, hidden);
                push_linear(specs, &format!("{p}.linear2"), hidden, dim);
                push_norm(specs, &format!("{p}.norm1"), dim);
                push_norm(specs, &format!("{p}.norm2"), dim);
                if cross {
                    push_norm(specs, &format!("{p}.norm3"), dim);
                }
                if self.t_layer_scale {
                    for gamma in ["gamma_1", "gamma_2"] {
                        specs.push(ParamSpec::new(
                            format!("{p}.{gamma}.scale"),
                            &[dim],
                            ParamInit::Constant(1e-4),
                        ));
                    }
                }
                if self.t_norm_out {
                    push_norm(specs, &format!("{p}.norm_out"), dim);
                }
            }
        }
    }

    /// Transformer layers alternate; the parity of the first cross layer is configurable
    pub fn is_cross_layer(&self, idx: usize) -> bool {
        let classic_parity = if self.t_cross_first { 1 } else { 0 };
        idx % 2 != classic_parity
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.parameter_specs().iter().map(ParamSpec::numel).sum()
    }

    /// Deterministic random weights matching this architecture
    pub fn random_weights(&self, seed: u64) -> WeightStore {
        WeightStore::random(&self.parameter_specs(), seed)
    }

    /// Recover the architecture from tensor shapes.
    ///
    /// Values that leave no trace in the weights (sample rate, segment,
    /// heads, stride, ...) are taken from `base`.
    pub fn infer(store: &WeightStore, base: &HTDemucsConfig) -> MlResult<Self> {
        let mut cfg = base.clone();
        let shape = |name: &str| store.shape(name).map(<[usize]>::to_vec);

        let first = shape("encoder.0.conv.weight").ok_or_else(|| MlError::MissingTensor {
            name: "encoder.0.conv.weight".into(),
        })?;
        if first.len() != 4 {
            return Err(MlError::ModelLoadFailed {
                reason: format!("encoder.0.conv.weight has rank {}, expected 4", first.len()),
            });
        }

        cfg.depth = (0..).take_while(|i| store.contains(&format!("encoder.{i}.conv.weight"))).count();
        cfg.channels = first[0];
        cfg.audio_channels = first[1] / 2;
        cfg.kernel_size = first[2];
        cfg.stride = cfg.kernel_size / 2;

        if let Some(second) = shape("encoder.1.conv.weight") {
            cfg.growth = (second[0] / cfg.channels.max(1)).max(1);
        }

        let last_dec = format!("decoder.{}.conv_tr.weight", cfg.depth - 1);
        let out = shape(&last_dec).ok_or_else(|| MlError::MissingTensor { name: last_dec.clone() })?;
        let num_sources = out[1] / (cfg.audio_channels * 2).max(1);
        if num_sources != cfg.sources.len() {
            cfg.sources = StemType::for_source_count(num_sources)?;
        }

        let enc_dconv = store.contains("encoder.0.dconv.layers.0.0.weight");
        let dec_dconv = store.contains("decoder.0.dconv.layers.0.0.weight");
        cfg.dconv_mode = u8::from(enc_dconv) | (u8::from(dec_dconv) << 1);
        let dconv_prefix = if enc_dconv { "encoder" } else { "decoder" };
        if enc_dconv || dec_dconv {
            cfg.dconv_depth = (0..)
                .take_while(|d| store.contains(&format!("{dconv_prefix}.0.dconv.layers.{d}.0.weight")))
                .count();
            if let Some(hidden) = shape(&format!("{dconv_prefix}.0.dconv.layers.0.0.weight")) {
                cfg.dconv_comp = (hidden[1] / hidden[0].max(1)).max(1);
            }
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

        match shape("freq_emb.embedding.weight") {
            Some(emb) => {
                if cfg.freq_emb <= 0.0 {
                    cfg.freq_emb = 0.2;
                }
                cfg.nfft = emb[0] * cfg.stride * 2;
            }
            None => cfg.freq_emb = 0.0,
        }

        cfg.bottom_channels = shape("channel_upsampler.weight").map(|s| s[0]).unwrap_or(0);
        cfg.t_layers = (0..)
            .take_while(|i| store.contains(&format!("crosstransformer.layers.{i}.linear1.weight")))
            .count();
        if cfg.t_layers > 0 {
            if let Some(l1) = shape("crosstransformer.layers.0.linear1.weight") {
                cfg.t_hidden_scale = l1[0] as f32 / l1[1] as f32;
            }
            cfg.t_cross_first = store.contains("crosstransformer.layers.0.cross_attn.in_proj_weight");
            cfg.t_norm_in = store.contains("crosstransformer.norm_in.weight");
            cfg.t_norm_out = store.contains("crosstransformer.layers.0.norm_out.weight");
            cfg.t_layer_scale = store.contains("crosstransformer.layers.0.gamma_1.scale");
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
