//! Dual Regression Network primary model.
//!
//! U-shaped: the low-resolution input is first upsampled bicubically to the target size,
//! encoded by `phase` stride-2 down blocks, then decoded by `phase` up blocks that each double
//! the resolution and concatenate the matching encoder feature map. Every decoder level has its
//! own tail, so the network yields `phase + 1` images.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;

use crate::down_block::{DownBlock, DownBlockConfig};
use crate::network::{NetworkOptions, SrNetwork};
use crate::params::{
    export_seq, import_seq, join_key, NamedParams, ParamSource, StateDict, StateDictResult,
};

const RGB_MEAN: [f32; 3] = [0.4488, 0.4371, 0.4040];
const CA_REDUCTION: usize = 16;

fn conv(in_channels: usize, out_channels: usize, kernel: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_padding(PaddingConfig2d::Explicit(kernel / 2, kernel / 2))
}

/// Rearrange `[b, c*r*r, h, w]` into `[b, c, h*r, w*r]`.
pub fn pixel_shuffle<B: Backend>(x: Tensor<B, 4>, r: usize) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    let out_c = c / (r * r);
    x.reshape([b, out_c, r, r, h, w])
        .permute([0, 1, 4, 2, 5, 3])
        .reshape([b, out_c, h * r, w * r])
}

/// Channel attention: global average pool, squeeze, excite, rescale.
#[derive(Debug, Module)]
pub struct ChannelAttention<B: Backend> {
    squeeze: Conv2d<B>,
    excite: Conv2d<B>,
}

impl<B: Backend> ChannelAttention<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let hidden = (channels / CA_REDUCTION).max(1);
        Self {
            squeeze: conv(channels, hidden, 1).init(device),
            excite: conv(hidden, channels, 1).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let pooled = x.clone().mean_dim(2).mean_dim(3);
        let y = sigmoid(self.excite.forward(relu(self.squeeze.forward(pooled))));
        x * y
    }
}

impl<B: Backend> NamedParams<B> for ChannelAttention<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        self.squeeze.export_params(&join_key(prefix, "conv_du.0"), dict)?;
        self.excite.export_params(&join_key(prefix, "conv_du.2"), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        self.squeeze = self.squeeze.import_params(&join_key(prefix, "conv_du.0"), source)?;
        self.excite = self.excite.import_params(&join_key(prefix, "conv_du.2"), source)?;
        Ok(self)
    }
}

/// Residual channel-attention block.
#[derive(Debug, Module)]
pub struct Rcab<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    attention: ChannelAttention<B>,
}

impl<B: Backend> Rcab<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv(channels, channels, 3).init(device),
            conv2: conv(channels, channels, 3).init(device),
            attention: ChannelAttention::new(channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let res = self.conv2.forward(relu(self.conv1.forward(x.clone())));
        self.attention.forward(res) + x
    }
}

impl<B: Backend> NamedParams<B> for Rcab<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        self.conv1.export_params(&join_key(prefix, "body.0"), dict)?;
        self.conv2.export_params(&join_key(prefix, "body.2"), dict)?;
        self.attention.export_params(&join_key(prefix, "body.3"), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        self.conv1 = self.conv1.import_params(&join_key(prefix, "body.0"), source)?;
        self.conv2 = self.conv2.import_params(&join_key(prefix, "body.2"), source)?;
        self.attention = self.attention.import_params(&join_key(prefix, "body.3"), source)?;
        Ok(self)
    }
}

/// Decoder stage: residual blocks, a x2 pixel-shuffle upsampler, then a 1x1 projection.
///
/// Keys: `{j}.body.*` for block `j`, `{n}.0.*` for the upsampler conv and `{n+1}.*` for the
/// projection, `n` being the block count.
#[derive(Debug, Module)]
pub struct UpBlock<B: Backend> {
    blocks: Vec<Rcab<B>>,
    upsampler: Conv2d<B>,
    project: Conv2d<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(channels: usize, out_channels: usize, n_blocks: usize, device: &B::Device) -> Self {
        Self {
            blocks: (0..n_blocks).map(|_| Rcab::new(channels, device)).collect(),
            upsampler: conv(channels, channels * 4, 3).init(device),
            project: conv(channels, out_channels, 1).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = pixel_shuffle(self.upsampler.forward(x), 2);
        self.project.forward(x)
    }
}

impl<B: Backend> NamedParams<B> for UpBlock<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        let n = self.blocks.len();
        export_seq(&self.blocks, prefix, dict)?;
        self.upsampler
            .export_params(&join_key(prefix, &format!("{n}.0")), dict)?;
        self.project
            .export_params(&join_key(prefix, &(n + 1).to_string()), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        let n = self.blocks.len();
        self.blocks = import_seq(self.blocks, prefix, source)?;
        self.upsampler = self
            .upsampler
            .import_params(&join_key(prefix, &format!("{n}.0")), source)?;
        self.project = self
            .project
            .import_params(&join_key(prefix, &(n + 1).to_string()), source)?;
        Ok(self)
    }
}

#[derive(Debug, Module)]
pub struct Drn<B: Backend> {
    head: Conv2d<B>,
    down: Vec<DownBlock<B>>,
    up_blocks: Vec<UpBlock<B>>,
    tail: Vec<Conv2d<B>>,
    upscale: usize,
    n_colors: usize,
    rgb_range: f32,
}

impl<B: Backend> Drn<B> {
    /// Build from `options`. An empty scale ladder yields a single-level identity-size network.
    pub fn new(options: &NetworkOptions, device: &B::Device) -> Self {
        let phase = options.scale.len();
        let upscale = options.final_scale().unwrap_or(1).max(1);
        let f = options.n_feats;
        let head = conv(options.n_colors, f, 3).init(device);

        let down = (0..phase)
            .map(|p| {
                DownBlock::new(
                    DownBlockConfig {
                        scale: 2,
                        n_feats: f << p,
                        in_channels: f << p,
                        out_channels: f << (p + 1),
                        negval: options.negval,
                    },
                    device,
                )
            })
            .collect();

        // Level 0 decodes the bottleneck alone; later levels see bottleneck output concatenated
        // with the skip copy, hence twice the channels.
        let up_blocks = (0..phase)
            .map(|idx| {
                let level = phase - idx;
                let channels = if idx == 0 { f << phase } else { (f << level) * 2 };
                UpBlock::new(channels, f << (level - 1), options.n_blocks, device)
            })
            .collect();

        let mut tail = vec![conv(f << phase, options.n_colors, 3).init(device)];
        for level in (1..=phase).rev() {
            tail.push(conv(f << level, options.n_colors, 3).init(device));
        }

        Self {
            head,
            down,
            up_blocks,
            tail,
            upscale,
            n_colors: options.n_colors,
            rgb_range: options.rgb_range,
        }
    }

    fn mean_shift(&self, x: Tensor<B, 4>, sign: f32) -> Tensor<B, 4> {
        if self.n_colors != RGB_MEAN.len() {
            return x;
        }
        let shift: Vec<f32> = RGB_MEAN.iter().map(|m| sign * m * self.rgb_range).collect();
        let shift = Tensor::<B, 1>::from_floats(shift.as_slice(), &x.device())
            .reshape([1, self.n_colors, 1, 1]);
        x + shift
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let [_, _, h, w] = input.dims();
        let x = if self.upscale > 1 {
            interpolate(
                input,
                [h * self.upscale, w * self.upscale],
                InterpolateOptions::new(InterpolateMode::Bicubic),
            )
        } else {
            input
        };
        let mut x = self.head.forward(self.mean_shift(x, -1.0));

        let mut copies = Vec::with_capacity(self.down.len());
        for down in &self.down {
            copies.push(x.clone());
            x = down.forward(x);
        }

        let mut results = Vec::with_capacity(self.tail.len());
        results.push(self.mean_shift(self.tail[0].forward(x.clone()), 1.0));
        for (idx, up) in self.up_blocks.iter().enumerate() {
            x = up.forward(x);
            if let Some(skip) = copies.pop() {
                x = Tensor::cat(vec![x, skip], 1);
            }
            results.push(self.mean_shift(self.tail[idx + 1].forward(x.clone()), 1.0));
        }
        results
    }
}

impl<B: Backend> NamedParams<B> for Drn<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        self.head.export_params(&join_key(prefix, "head"), dict)?;
        export_seq(&self.down, &join_key(prefix, "down"), dict)?;
        export_seq(&self.up_blocks, &join_key(prefix, "up_blocks"), dict)?;
        export_seq(&self.tail, &join_key(prefix, "tail"), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        self.head = self.head.import_params(&join_key(prefix, "head"), source)?;
        self.down = import_seq(self.down, &join_key(prefix, "down"), source)?;
        self.up_blocks = import_seq(self.up_blocks, &join_key(prefix, "up_blocks"), source)?;
        self.tail = import_seq(self.tail, &join_key(prefix, "tail"), source)?;
        Ok(self)
    }
}

impl<B: Backend> SrNetwork<B> for Drn<B> {
    fn build(options: &NetworkOptions, device: &B::Device) -> Self {
        Self::new(options, device)
    }

    fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        Drn::forward(self, input)
    }
}
