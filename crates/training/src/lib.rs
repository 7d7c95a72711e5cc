#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod experiment;
pub mod migrate;
pub mod options;
pub mod parallel;
pub mod run;
pub mod wrapper;

pub use checkpoint::{
    load_dual_state_dicts, load_state_dict, parse_checkpoint_arg, save_dual_state_dicts,
    save_state_dict, CheckpointError, CheckpointKind, CheckpointNaming, CheckpointPaths,
    CheckpointResult,
};
pub use config::{ConfigError, RunConfig, CONFIG_ENV};
pub use device::{
    default_device_pool, validate_backend_choice, BackendKind, DeviceError, DevicePool, TrainDevice,
};
pub use experiment::{ExperimentError, ExperimentLog};
pub use migrate::{migrate, partition_up_blocks, MigrationError, UpBlockBuckets};
pub use options::{scale_ladder, ModelOptions};
pub use parallel::{DataParallel, Gather, ModelHandle, Unwrappable};
pub use wrapper::{downsample_factor, ModelWrapper, WrapperError, WrapperResult};

/// Backend alias for the binaries (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
