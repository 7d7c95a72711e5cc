//! Burn modules for dual-regression super-resolution.
//!
//! This crate defines the networks the training wrapper drives:
//! - `Drn`: the primary U-shaped super-resolution network.
//! - `DownBlock`: the stride-2 dual network that maps SR output back down.
//!
//! Both describe their parameters by dot-separated path (`params`), which is what checkpoint
//! files, legacy-checkpoint migration and non-strict loading operate on. The `training` crate
//! wraps them into device placement and checkpoint handling.

pub mod down_block;
pub mod drn;
pub mod network;
pub mod params;

pub use down_block::{DownBlock, DownBlockConfig};
pub use drn::{pixel_shuffle, ChannelAttention, Drn, Rcab, UpBlock};
pub use network::{DualNetwork, NetworkOptions, ScaleSelectable, SrNetwork};
pub use params::{
    join_key, module_order, trainable_params, LoadReport, NamedParams, ParamSource, ParamTensor,
    StateDict, StateDictError, StateDictResult,
};

pub mod prelude {
    pub use super::{
        DownBlock, DownBlockConfig, Drn, DualNetwork, NamedParams, NetworkOptions, ParamTensor,
        ScaleSelectable, SrNetwork, StateDict,
    };
}
