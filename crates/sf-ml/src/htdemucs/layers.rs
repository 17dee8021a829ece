//! Encoder / decoder layers shared by the hybrid models
//!
//! Every feature map is `[C, H, W]`. The spectral branch uses `H = Fr`
//! frequency rows and `W = T` frames; the waveform branch is `[C, 1, T]`.
//! Strided convolutions run along `H` for the spectral branch and along `W`
//! for the waveform branch. Layers below the point where the spectral
//! branch has a single row left are waveform-shaped too.

use ndarray::{s, Array3, ArrayView3, Axis};

use crate::error::{MlError, MlResult};
use crate::nn::{gelu, glu, Conv2d, ConvTranspose2d, GroupNorm, LayerScale, LocalAttention, ResidualBiLstm};
use crate::weights::{push_bilstm, push_conv, push_conv_tr, push_linear, push_norm, ParamInit, ParamSpec, WeightStore};

/// BiLSTM window inside residual branches
const LSTM_MAX_STEPS: usize = 200;
const LSTM_LAYERS: usize = 2;
const ATTN_HEADS: usize = 4;
const ATTN_DECAYS: usize = 4;

/// Which axis a layer convolves over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Freq,
    Time,
}

/// Residual branch options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DConvOptions {
    pub depth: usize,
    /// Hidden width is `channels / compress`
    pub compress: usize,
    /// Initial LayerScale, only used for synthetic weights
    pub init: f32,
    /// BiLSTM after the dilated convolution
    pub lstm: bool,
    /// Local attention after the dilated convolution (and the BiLSTM)
    pub attn: bool,
}

impl DConvOptions {
    pub fn hidden(&self, channels: usize) -> usize {
        channels / self.compress.max(1)
    }

    /// Modules inserted between the GELU and the pointwise convolution
    fn inserted(&self) -> usize {
        usize::from(self.lstm) + usize::from(self.attn)
    }

    fn push_specs(&self, specs: &mut Vec<ParamSpec>, prefix: &str, channels: usize) {
        let hidden = self.hidden(channels);
        let extra = self.inserted();
        for d in 0..self.depth {
            let p = format!("{prefix}.layers.{d}");
            push_conv(specs, &format!("{p}.0"), &[hidden, channels, 3]);
            push_norm(specs, &format!("{p}.1"), hidden);
            if self.lstm {
                push_bilstm(specs, &format!("{p}.3.lstm"), hidden, hidden, LSTM_LAYERS);
                push_linear(specs, &format!("{p}.3.linear"), 2 * hidden, hidden);
            }
            if self.attn {
                let a = format!("{p}.{}", 3 + usize::from(self.lstm));
                for name in ["content", "query", "key", "proj"] {
                    push_conv(specs, &format!("{a}.{name}"), &[hidden, hidden, 1]);
                }
                push_conv(specs, &format!("{a}.query_decay"), &[ATTN_HEADS * ATTN_DECAYS, hidden, 1]);
            }
            push_conv(specs, &format!("{p}.{}", 3 + extra), &[2 * channels, hidden, 1]);
            push_norm(specs, &format!("{p}.{}", 4 + extra), 2 * channels);
            specs.push(ParamSpec::new(
                format!("{p}.{}.scale", 6 + extra),
                &[channels],
                ParamInit::Constant(self.init),
            ));
        }
    }

    /// Channel counts the residual branch cannot run with
    pub fn check(&self, channels: usize) -> Result<(), String> {
        if self.compress == 0 || channels % self.compress != 0 {
            return Err(format!("{channels} channels not divisible by dconv_comp {}", self.compress));
        }
        if self.attn && self.hidden(channels) % ATTN_HEADS != 0 {
            return Err(format!(
                "local attention needs a hidden width divisible by {ATTN_HEADS}, got {}",
                self.hidden(channels)
            ));
        }
        Ok(())
    }
}

/// Shape and options of one encoder or decoder layer.
///
/// For decoders `chin` is the width coming up from below and `chout` the
/// width handed to the next decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerGeometry {
    pub branch: Branch,
    pub chin: usize,
    pub chout: usize,
    pub kernel: usize,
    pub stride: usize,
    /// Encoder padding, and the crop after decoder transposed convolutions
    pub pad: usize,
    /// GroupNorm groups, `None` without normalisation
    pub norm_groups: Option<usize>,
    /// Rewrite context (kernel `1 + 2 * context`), `None` without rewrite
    pub rewrite: Option<usize>,
    pub dconv: Option<DConvOptions>,
    /// Encoder: convolution only. Decoder: transposed convolution and norm only.
    pub empty: bool,
    /// Outermost decoder, no final GELU
    pub last: bool,
}

impl LayerGeometry {
    pub fn push_encoder_specs(&self, specs: &mut Vec<ParamSpec>, prefix: &str) {
        let (chin, chout, k) = (self.chin, self.chout, self.kernel);
        match self.branch {
            Branch::Freq => push_conv(specs, &format!("{prefix}.conv"), &[chout, chin, k, 1]),
            Branch::Time => push_conv(specs, &format!("{prefix}.conv"), &[chout, chin, k]),
        }
        if self.empty {
            return;
        }
        if self.norm_groups.is_some() {
            push_norm(specs, &format!("{prefix}.norm1"), chout);
        }
        if let Some(dconv) = &self.dconv {
            dconv.push_specs(specs, &format!("{prefix}.dconv"), chout);
        }
        if let Some(context) = self.rewrite {
            self.push_rewrite(specs, &format!("{prefix}.rewrite"), chout, context);
            if self.norm_groups.is_some() {
                push_norm(specs, &format!("{prefix}.norm2"), 2 * chout);
            }
        }
    }

    pub fn push_decoder_specs(&self, specs: &mut Vec<ParamSpec>, prefix: &str) {
        let (chin, chout, k) = (self.chin, self.chout, self.kernel);
        if !self.empty {
            if let Some(context) = self.rewrite {
                self.push_rewrite(specs, &format!("{prefix}.rewrite"), chin, context);
                if self.norm_groups.is_some() {
                    push_norm(specs, &format!("{prefix}.norm1"), 2 * chin);
                }
            }
            if let Some(dconv) = &self.dconv {
                dconv.push_specs(specs, &format!("{prefix}.dconv"), chin);
            }
        }
        match self.branch {
            Branch::Freq => push_conv_tr(specs, &format!("{prefix}.conv_tr"), &[chin, chout, k, 1]),
            Branch::Time => push_conv_tr(specs, &format!("{prefix}.conv_tr"), &[chin, chout, k]),
        }
        if self.norm_groups.is_some() {
            push_norm(specs, &format!("{prefix}.norm2"), chout);
        }
    }

    fn push_rewrite(&self, specs: &mut Vec<ParamSpec>, prefix: &str, channels: usize, context: usize) {
        let kr = 1 + 2 * context;
        match self.branch {
            Branch::Freq => push_conv(specs, prefix, &[2 * channels, channels, kr, kr]),
            Branch::Time => push_conv(specs, prefix, &[2 * channels, channels, kr]),
        }
    }

    fn load_rewrite(&self, store: &WeightStore, prefix: &str, channels: usize, context: usize) -> MlResult<Conv2d> {
        let kr = 1 + 2 * context;
        Ok(match self.branch {
            Branch::Freq => {
                Conv2d::load(store, prefix, [2 * channels, channels, kr, kr])?.with_padding((context, context))
            }
            Branch::Time => Conv2d::load_1d(store, prefix, [2 * channels, channels, kr])?.with_padding((0, context)),
        })
    }

    fn load_norm(&self, store: &WeightStore, prefix: &str, channels: usize) -> MlResult<Option<GroupNorm>> {
        self.norm_groups
            .map(|groups| GroupNorm::load(store, prefix, groups, channels))
            .transpose()
    }
}

/// One residual step of [`DConv`]
#[derive(Debug, Clone)]
struct DConvBlock {
    dilated: Conv2d,
    norm1: GroupNorm,
    lstm: Option<ResidualBiLstm>,
    attn: Option<LocalAttention>,
    pointwise: Conv2d,
    norm2: GroupNorm,
    scale: LayerScale,
}

impl DConvBlock {
    /// Sequence layers run on each row's `[W, C]` tokens
    fn sequence_layers(&self, y: &mut Array3<f32>) -> MlResult<()> {
        for h in 0..y.len_of(Axis(1)) {
            let mut tokens = y.index_axis(Axis(1), h).t().to_owned();
            if let Some(lstm) = &self.lstm {
                tokens = lstm.forward(tokens.view())?;
            }
            if let Some(attn) = &self.attn {
                tokens = attn.forward(tokens.view())?;
            }
            y.index_axis_mut(Axis(1), h).assign(&tokens.t());
        }
        Ok(())
    }
}

/// Dilated residual branch: `depth` blocks with dilation `2^d`, each
/// normalised per row so frequency rows never mix.
#[derive(Debug, Clone)]
pub struct DConv {
    blocks: Vec<DConvBlock>,
}

impl DConv {
    pub fn load(store: &WeightStore, prefix: &str, channels: usize, options: &DConvOptions) -> MlResult<Self> {
        let hidden = options.hidden(channels);
        let extra = options.inserted();
        let blocks = (0..options.depth)
            .map(|d| {
                let p = format!("{prefix}.layers.{d}");
                let dilation = 1usize << d;
                let lstm = options
                    .lstm
                    .then(|| ResidualBiLstm::load(store, &format!("{p}.3"), hidden, LSTM_LAYERS, LSTM_MAX_STEPS))
                    .transpose()?;
                let attn = options
                    .attn
                    .then(|| {
                        let at = 3 + usize::from(options.lstm);
                        LocalAttention::load(store, &format!("{p}.{at}"), hidden, ATTN_HEADS, ATTN_DECAYS)
                    })
                    .transpose()?;
                Ok(DConvBlock {
                    dilated: Conv2d::load_1d(store, &format!("{p}.0"), [hidden, channels, 3])?
                        .with_dilation((1, dilation))
                        .with_padding((0, dilation)),
                    norm1: GroupNorm::load(store, &format!("{p}.1"), 1, hidden)?,
                    lstm,
                    attn,
                    pointwise: Conv2d::load_1d(store, &format!("{p}.{}", 3 + extra), [2 * channels, hidden, 1])?,
                    norm2: GroupNorm::load(store, &format!("{p}.{}", 4 + extra), 1, 2 * channels)?,
                    scale: LayerScale::load(store, &format!("{p}.{}", 6 + extra), channels)?,
                })
            })
            .collect::<MlResult<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(&self, mut x: Array3<f32>) -> MlResult<Array3<f32>> {
        for block in &self.blocks {
            let mut y = block.dilated.forward(x.view())?;
            block.norm1.forward_rows(&mut y);
            gelu(&mut y);
            if block.lstm.is_some() || block.attn.is_some() {
                block.sequence_layers(&mut y)?;
            }
            let mut y = block.pointwise.forward(y.view())?;
            block.norm2.forward_rows(&mut y);
            let mut y = glu(&y)?;
            block.scale.apply(&mut y);
            x += &y;
        }
        Ok(x)
    }
}

/// Encoder layer: strided conv, GELU, DConv, rewrite + GLU
#[derive(Debug, Clone)]
pub struct HEncLayer {
    branch: Branch,
    stride: usize,
    empty: bool,
    conv: Conv2d,
    norm1: Option<GroupNorm>,
    dconv: Option<DConv>,
    rewrite: Option<Conv2d>,
    norm2: Option<GroupNorm>,
}

impl HEncLayer {
    pub fn load(store: &WeightStore, prefix: &str, geometry: &LayerGeometry) -> MlResult<Self> {
        let g = geometry;
        let conv = match g.branch {
            Branch::Freq => Conv2d::load(store, &format!("{prefix}.conv"), [g.chout, g.chin, g.kernel, 1])?
                .with_stride((g.stride, 1))
                .with_padding((g.pad, 0)),
            Branch::Time => Conv2d::load_1d(store, &format!("{prefix}.conv"), [g.chout, g.chin, g.kernel])?
                .with_stride((1, g.stride))
                .with_padding((0, g.pad)),
        };

        let mut layer = Self {
            branch: g.branch,
            stride: g.stride,
            empty: g.empty,
            conv,
            norm1: None,
            dconv: None,
            rewrite: None,
            norm2: None,
        };
        if g.empty {
            return Ok(layer);
        }

        layer.norm1 = g.load_norm(store, &format!("{prefix}.norm1"), g.chout)?;
        layer.dconv = g
            .dconv
            .map(|options| DConv::load(store, &format!("{prefix}.dconv"), g.chout, &options))
            .transpose()?;
        if let Some(context) = g.rewrite {
            layer.rewrite = Some(g.load_rewrite(store, &format!("{prefix}.rewrite"), g.chout, context)?);
            layer.norm2 = g.load_norm(store, &format!("{prefix}.norm2"), 2 * g.chout)?;
        }
        Ok(layer)
    }

    /// Only the strided convolution
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        self.forward_injected(x, None)
    }

    /// `inject` is added right after the strided convolution; it carries the
    /// waveform branch into the layer where both branches merge
    pub fn forward_injected(&self, x: ArrayView3<f32>, inject: Option<ArrayView3<f32>>) -> MlResult<Array3<f32>> {
        let mut y = match self.branch {
            Branch::Time => {
                let (channels, rows, length) = x.dim();
                let rem = length % self.stride;
                if rem != 0 {
                    let mut padded = Array3::<f32>::zeros((channels, rows, length + self.stride - rem));
                    padded.slice_mut(s![.., .., ..length]).assign(&x);
                    self.conv.forward(padded.view())?
                } else {
                    self.conv.forward(x)?
                }
            }
            Branch::Freq => self.conv.forward(x)?,
        };
        if self.empty {
            return Ok(y);
        }

        if let Some(inject) = inject {
            if inject.dim() != y.dim() {
                return Err(MlError::InvalidInputShape {
                    expected: format!("injected branch {:?}", y.dim()),
                    got: format!("{:?}", inject.dim()),
                });
            }
            y += &inject;
        }

        if let Some(norm) = &self.norm1 {
            norm.forward(&mut y);
        }
        gelu(&mut y);

        if let Some(dconv) = &self.dconv {
            y = dconv.forward(y)?;
        }

        match &self.rewrite {
            Some(rewrite) => {
                let mut z = rewrite.forward(y.view())?;
                if let Some(norm) = &self.norm2 {
                    norm.forward(&mut z);
                }
                glu(&z)
            }
            None => Ok(y),
        }
    }
}

/// Decoder layer: skip add, rewrite + GLU, DConv, transposed conv, crop
#[derive(Debug, Clone)]
pub struct HDecLayer {
    branch: Branch,
    pad: usize,
    last: bool,
    empty: bool,
    rewrite: Option<Conv2d>,
    norm1: Option<GroupNorm>,
    dconv: Option<DConv>,
    conv_tr: ConvTranspose2d,
    norm2: Option<GroupNorm>,
}

impl HDecLayer {
    pub fn load(store: &WeightStore, prefix: &str, geometry: &LayerGeometry) -> MlResult<Self> {
        let g = geometry;
        let conv_tr = match g.branch {
            Branch::Freq => ConvTranspose2d::load(
                store,
                &format!("{prefix}.conv_tr"),
                [g.chin, g.chout, g.kernel, 1],
                (g.stride, 1),
            )?,
            Branch::Time => {
                ConvTranspose2d::load_1d(store, &format!("{prefix}.conv_tr"), [g.chin, g.chout, g.kernel], g.stride)?
            }
        };

        let mut layer = Self {
            branch: g.branch,
            pad: g.pad,
            last: g.last,
            empty: g.empty,
            rewrite: None,
            norm1: None,
            dconv: None,
            conv_tr,
            norm2: g.load_norm(store, &format!("{prefix}.norm2"), g.chout)?,
        };
        if g.empty {
            return Ok(layer);
        }

        if let Some(context) = g.rewrite {
            layer.rewrite = Some(g.load_rewrite(store, &format!("{prefix}.rewrite"), g.chin, context)?);
            layer.norm1 = g.load_norm(store, &format!("{prefix}.norm1"), 2 * g.chin)?;
        }
        layer.dconv = g
            .dconv
            .map(|options| DConv::load(store, &format!("{prefix}.dconv"), g.chin, &options))
            .transpose()?;
        Ok(layer)
    }

    /// Only the transposed convolution, fed without a skip connection
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// `length` is the time-axis length before the matching encoder
    pub fn forward(&self, x: Array3<f32>, skip: &Array3<f32>, length: usize) -> MlResult<Array3<f32>> {
        self.forward_with_pre(x, skip, length).map(|(z, _)| z)
    }

    /// Also returns the input of the transposed convolution, which feeds the
    /// waveform decoder where the branches split
    pub fn forward_with_pre(
        &self,
        x: Array3<f32>,
        skip: &Array3<f32>,
        length: usize,
    ) -> MlResult<(Array3<f32>, Array3<f32>)> {
        if self.empty {
            return Err(MlError::InferenceFailed {
                reason: "decoder without rewrite takes no skip connection".into(),
            });
        }
        if x.dim() != skip.dim() {
            return Err(MlError::InvalidInputShape {
                expected: format!("skip connection {:?}", skip.dim()),
                got: format!("{:?}", x.dim()),
            });
        }
        let x = x + skip;

        let mut y = match &self.rewrite {
            Some(rewrite) => {
                let mut z = rewrite.forward(x.view())?;
                if let Some(norm) = &self.norm1 {
                    norm.forward(&mut z);
                }
                glu(&z)?
            }
            None => x,
        };

        if let Some(dconv) = &self.dconv {
            y = dconv.forward(y)?;
        }

        let z = self.upsample(y.view(), length)?;
        Ok((z, y))
    }

    /// Transposed convolution, norm and crop only
    pub fn forward_empty(&self, x: ArrayView3<f32>, length: usize) -> MlResult<Array3<f32>> {
        self.upsample(x, length)
    }

    fn upsample(&self, y: ArrayView3<f32>, length: usize) -> MlResult<Array3<f32>> {
        let mut z = self.conv_tr.forward(y)?;
        if let Some(norm) = &self.norm2 {
            norm.forward(&mut z);
        }

        let mut z = match self.branch {
            Branch::Freq => {
                let rows = z.len_of(Axis(1));
                z.slice(s![.., self.pad..rows - self.pad, ..]).to_owned()
            }
            Branch::Time => {
                let available = z.len_of(Axis(2));
                if self.pad + length > available {
                    return Err(MlError::InvalidOutputShape {
                        expected: format!("at least {} samples", self.pad + length),
                        got: available.to_string(),
                    });
                }
                z.slice(s![.., .., self.pad..self.pad + length]).to_owned()
            }
        };

        if !self.last {
            gelu(&mut z);
        }
        Ok(z)
    }
}
