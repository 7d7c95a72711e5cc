use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::network::{DualNetwork, NetworkOptions};
use crate::params::{join_key, NamedParams, ParamSource, StateDict, StateDictResult};

#[derive(Debug, Clone)]
pub struct DownBlockConfig {
    /// Downsampling factor; one stride-2 stage per whole power of two, at least one.
    pub scale: usize,
    pub n_feats: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub negval: f64,
}

impl Default for DownBlockConfig {
    fn default() -> Self {
        Self {
            scale: 2,
            n_feats: 16,
            in_channels: 3,
            out_channels: 3,
            negval: 0.2,
        }
    }
}

impl DownBlockConfig {
    pub fn stages(&self) -> usize {
        (self.scale.max(1).ilog2() as usize).max(1)
    }
}

/// Stride-2 convolution stack used both inside the DRN encoder and as the dual model.
///
/// Parameters are keyed `dual_module.{k}.0.weight` for the strided stages and
/// `dual_module.{stages}.weight` for the output projection.
#[derive(Debug, Module)]
pub struct DownBlock<B: Backend> {
    stages: Vec<Conv2d<B>>,
    out: Conv2d<B>,
    negval: f64,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(cfg: DownBlockConfig, device: &B::Device) -> Self {
        let mut stages = Vec::new();
        let mut in_channels = cfg.in_channels;
        for _ in 0..cfg.stages() {
            stages.push(
                Conv2dConfig::new([in_channels, cfg.n_feats], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_bias(false)
                    .init(device),
            );
            in_channels = cfg.n_feats;
        }
        let out = Conv2dConfig::new([cfg.n_feats, cfg.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        Self {
            stages,
            out,
            negval: cfg.negval,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for stage in &self.stages {
            x = leaky_relu(stage.forward(x), self.negval);
        }
        self.out.forward(x)
    }
}

impl<B: Backend> NamedParams<B> for DownBlock<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        let base = join_key(prefix, "dual_module");
        for (idx, stage) in self.stages.iter().enumerate() {
            stage.export_params(&join_key(&base, &format!("{idx}.0")), dict)?;
        }
        self.out
            .export_params(&join_key(&base, &self.stages.len().to_string()), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        let base = join_key(prefix, "dual_module");
        let n = self.stages.len();
        self.stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(idx, stage)| stage.import_params(&join_key(&base, &format!("{idx}.0")), source))
            .collect::<StateDictResult<_>>()?;
        self.out = self.out.import_params(&join_key(&base, &n.to_string()), source)?;
        Ok(self)
    }
}

impl<B: Backend> DualNetwork<B> for DownBlock<B> {
    fn build(options: &NetworkOptions, factor: usize, device: &B::Device) -> Self {
        Self::new(
            DownBlockConfig {
                scale: factor,
                n_feats: options.n_feats,
                in_channels: options.n_colors,
                out_channels: options.n_colors,
                negval: options.negval,
            },
            device,
        )
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        DownBlock::forward(self, input)
    }
}
