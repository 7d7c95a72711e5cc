//! Entry points behind the `build_model` and `migrate_ckpt` binaries.

use std::path::PathBuf;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::tensor::Tensor;
use clap::Parser;
use cli_support::{init_tracing, ModelArgs, RunArgs};
use tracing::info;

use crate::{
    default_device_pool, load_state_dict, migrate, partition_up_blocks, save_state_dict,
    validate_backend_choice, BackendKind, ExperimentLog, ModelWrapper, RunConfig, TrainBackend,
};

/// Autodiff backend, so model parameters are trainable.
type ModelBackend = Autodiff<TrainBackend>;

#[derive(Parser, Debug)]
#[command(
    name = "build_model",
    about = "Build the DRN model wrapper, load checkpoints and save it to the experiment dir"
)]
pub struct BuildModelArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Run one forward pass on a zero image of this size before saving.
    #[arg(long)]
    pub sample_size: Option<usize>,
    /// Also write the checkpoints as the best ones.
    #[arg(long, default_value_t = false)]
    pub best: bool,
    #[command(flatten)]
    pub model: ModelArgs,
    #[command(flatten)]
    pub run: RunArgs,
}

pub fn run_build_model(args: BuildModelArgs) -> anyhow::Result<()> {
    init_tracing(args.run.verbose);
    validate_backend_choice(args.backend)?;

    let mut cfg = RunConfig::load(args.run.config.as_deref())?;
    cfg.options.apply_args(&args.model);
    if let Some(dir) = &args.run.save_dir {
        cfg.save_dir = dir.clone();
    }

    let mut log = ExperimentLog::open(&cfg.save_dir)?;
    log.write_config(&cfg.options)?;

    let pool = default_device_pool(cfg.options.n_gpus);
    let mut wrapper = ModelWrapper::<ModelBackend>::new(cfg.options.clone(), &pool, &mut log)
        .context("building the model wrapper")?;
    info!(
        replicated = wrapper.is_replicated(),
        duals = wrapper.dual_models_len(),
        "model ready"
    );

    if let Some(size) = args.sample_size {
        let n_colors = wrapper.options().network.n_colors;
        let input = Tensor::<ModelBackend, 4>::zeros([1, n_colors, size, size], wrapper.device());
        let outputs = wrapper.forward_auto(input, 0);
        for (level, out) in outputs.iter().enumerate() {
            info!(level, dims = ?out.dims(), "sample output");
        }
        for idx in 0..wrapper.dual_models_len() {
            let Some(sr) = outputs.len().checked_sub(idx + 1).and_then(|i| outputs.get(i)) else {
                break;
            };
            let down = wrapper.dual_forward(idx, sr.clone())?;
            info!(dual = idx, dims = ?down.dims(), "sample dual output");
        }
    }

    let naming = wrapper.checkpoint_naming()?;
    wrapper.save(log.dir(), &naming, args.best)?;
    log.write_log(&format!(
        "Saved {}",
        naming
            .primary_path(log.dir(), crate::CheckpointKind::Latest)
            .display()
    ))?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "migrate_ckpt",
    about = "Patch a legacy DRN checkpoint with up-block weights from a new-format checkpoint"
)]
pub struct MigrateArgs {
    /// Legacy (four-branch) checkpoint.
    #[arg(long)]
    pub legacy: PathBuf,
    /// New-format (two-branch) checkpoint supplying the up-block weights.
    #[arg(long = "new")]
    pub new_ckpt: PathBuf,
    /// Output path for the merged checkpoint.
    #[arg(long)]
    pub out: PathBuf,
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

pub fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    init_tracing(args.verbose);
    let legacy = load_state_dict(&args.legacy)?;
    let new = load_state_dict(&args.new_ckpt)?;
    let buckets = partition_up_blocks(&legacy);
    let merged = migrate(legacy, &new)
        .with_context(|| format!("migrating {}", args.legacy.display()))?;
    save_state_dict(&args.out, &merged)?;
    info!(
        branch0 = buckets.branch0.len(),
        branch1 = buckets.branch1.len(),
        total = merged.len(),
        "wrote {}",
        args.out.display()
    );
    Ok(())
}
