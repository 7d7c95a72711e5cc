//! Factory and capability traits the training wrapper is generic over.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::params::NamedParams;

/// Architecture hyper-parameters shared by the primary and dual networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Upscaling ladder, e.g. `[2, 4]` for a x4 model.
    pub scale: Vec<usize>,
    pub n_colors: usize,
    pub n_feats: usize,
    /// Residual channel-attention blocks per up block.
    pub n_blocks: usize,
    /// LeakyReLU slope used by the down blocks.
    pub negval: f64,
    pub rgb_range: f32,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            scale: vec![2, 4],
            n_colors: 3,
            n_feats: 16,
            n_blocks: 30,
            negval: 0.2,
            rgb_range: 255.0,
        }
    }
}

impl NetworkOptions {
    pub fn final_scale(&self) -> Option<usize> {
        self.scale.last().copied()
    }
}

/// Networks that can switch the scale they produce.
pub trait ScaleSelectable {
    fn set_scale(&mut self, idx_scale: usize);
}

/// Primary super-resolution network.
pub trait SrNetwork<B: Backend>: Module<B> + NamedParams<B> {
    fn build(options: &NetworkOptions, device: &B::Device) -> Self;

    /// Per-level outputs, lowest resolution first.
    fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    /// Capability query for scale selection; `None` when the network has a single head.
    fn scale_selector(&mut self) -> Option<&mut dyn ScaleSelectable> {
        None
    }
}

/// Dual network mapping a high-resolution image back down by `factor`.
pub trait DualNetwork<B: Backend>: Module<B> + NamedParams<B> {
    fn build(options: &NetworkOptions, factor: usize, device: &B::Device) -> Self;

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}
